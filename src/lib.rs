//! # score_relay
//!
//! Ingests multicast book-update packets, keeps a 10-level book per subject,
//! prices each subject from its top of book and forwards the scaled composite
//! score downstream only when it changed.
//!
//! Modules, leaf first:
//! - [`wire`]: inbound packet decoder and outbound 12-byte score encoder
//! - [`orderbook`]: per-subject book and the lazy registry
//! - [`score`]: top-of-book composite score
//! - [`forwarder`]: atomic change detection, downstream sink and send log
//! - [`recorder`]: latency checkpoints, one CSV row per forwarded message
//! - [`pipeline`]: state machine per packet and the sharded worker pool
//! - [`ingest`] / [`capture`]: multicast receiver and capture replay
//! - [`synthetic`]: random packet streams for captures and benches
//!
//! ```no_run
//! use std::sync::Arc;
//! use score_relay::{
//!     forwarder::{Forwarder, TcpSink},
//!     metrics::Metrics,
//!     orderbook::BookRegistry,
//!     pipeline::{Dispatcher, PacketHandler, Pipeline},
//!     recorder::LatencyRecorder,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = quanta::Clock::new();
//! let sink = TcpSink::connect("127.0.0.1:9000")?;
//! let pipeline = Pipeline::new(
//!     Arc::new(BookRegistry::new()),
//!     Arc::new(Forwarder::new(sink, clock.clone())),
//!     Arc::new(LatencyRecorder::open("latency_trace.csv".as_ref())?),
//!     Arc::new(Metrics::new()),
//!     clock,
//! );
//! let dispatcher = Dispatcher::start(Arc::new(pipeline), 4, 4096)?;
//! dispatcher.ingress().handle(vec![0, 0, 0, 6, 0, 0, 0, 42, 0, 0])?;
//! dispatcher.drain();
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod ingest;
pub mod metrics;
pub mod orderbook;
pub mod pipeline;
pub mod recorder;
pub mod score;
pub mod synthetic;
pub mod types;
pub mod wire;
