/// Composite score relay: main entry point.
///
/// Architecture:
///   [multicast receiver | capture replay] → Ingress (bounded, per worker)
///        ↓
///   [worker threads] decode → book → score → forward-if-changed
///        ↓
///   [destination TCP stream] 12-byte score records + latency trace CSV
///
/// Runs until ENTER / stdin EOF, `--run-for-secs` elapses, or a replay ends.

use std::io::{BufRead, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use score_relay::capture::CaptureReader;
use score_relay::config::{Cli, RelayConfig, Source, StopWhen};
use score_relay::forwarder::{Forwarder, SendLog, TcpSink};
use score_relay::ingest::MulticastReceiver;
use score_relay::metrics::{Metrics, RunSummary};
use score_relay::orderbook::BookRegistry;
use score_relay::pipeline::{Dispatcher, PacketHandler, Pipeline};
use score_relay::recorder::LatencyRecorder;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cfg = Cli::parse().into_config()?;
    info!(?cfg, "starting score relay");

    let clock = quanta::Clock::new();
    let sink = TcpSink::connect(&cfg.destination)
        .with_context(|| format!("no destination at {}", cfg.destination))?;
    let recorder = LatencyRecorder::open(&cfg.latency_log)
        .with_context(|| format!("opening {}", cfg.latency_log.display()))?;

    let mut forwarder = Forwarder::new(sink, clock.clone());
    if let Some(path) = &cfg.send_log {
        let log = SendLog::create(path)
            .with_context(|| format!("creating send log {}", path.display()))?;
        forwarder = forwarder.with_send_log(log);
    }

    let pipeline = Pipeline::new(
        Arc::new(BookRegistry::new()),
        Arc::new(forwarder),
        Arc::new(recorder),
        Arc::new(Metrics::new()),
        clock,
    )
    .with_status(cfg.status);
    let pipeline = Arc::new(pipeline);

    let dispatcher = Dispatcher::start(Arc::clone(&pipeline), cfg.workers, cfg.queue_capacity)?;

    let processed = match &cfg.source {
        Source::Multicast { group, port, interface } => {
            let receiver = MulticastReceiver::join(*group, *port, *interface)?;
            let stop = Arc::new(AtomicBool::new(false));
            let ingress = dispatcher.ingress();
            let recv_stop = Arc::clone(&stop);
            let recv_handle = thread::Builder::new()
                .name("receiver".to_string())
                .spawn(move || receiver.run(&ingress, &recv_stop))
                .context("spawning receiver thread")?;

            wait_for_stop(&cfg);
            stop.store(true, Ordering::Release);
            match recv_handle.join() {
                Ok(n) => info!("receiver delivered {n} datagrams"),
                Err(_) => warn!("receiver thread panicked"),
            }
            dispatcher.shutdown()
        }
        Source::Replay(path) => {
            let reader = CaptureReader::open(path)
                .with_context(|| format!("opening capture {}", path.display()))?;
            info!("replaying {} ({} bytes)", path.display(), reader.len_bytes());
            let ingress = dispatcher.ingress();
            let mut packets = reader.packets();
            for packet in packets.by_ref() {
                if ingress.handle(packet.to_vec()).is_err() {
                    break;
                }
            }
            if packets.invalid() > 0 {
                warn!("capture had {} bad length fields", packets.invalid());
            }
            drop(ingress);
            dispatcher.drain()
        }
    };

    finish(&cfg, &pipeline, processed)
}

fn wait_for_stop(cfg: &RelayConfig) {
    match cfg.stop_when(std::io::stdin().is_terminal()) {
        StopWhen::After(d) => {
            info!("running for {d:?}");
            thread::sleep(d);
        }
        StopWhen::Enter => {
            info!("press ENTER to stop");
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => info!("stdin closed, stopping"),
                Ok(_) => info!("stop requested"),
                Err(e) => warn!("stdin read failed, stopping: {e}"),
            }
        }
        StopWhen::Killed => {
            info!("stdin is not a terminal; running until killed (use --run-for-secs for a timed run)");
            loop {
                thread::park();
            }
        }
    }
}

fn finish(cfg: &RelayConfig, pipeline: &Pipeline<TcpSink>, processed: u64) -> Result<()> {
    let summary = RunSummary {
        processed,
        subjects: pipeline.registry().len(),
        metrics: pipeline.metrics().snapshot(),
        latency: pipeline.recorder().summary(),
    };

    println!("\n=== Relay Summary ===");
    println!("Packets received:  {}", summary.metrics.packets_received);
    println!("Processed:         {}", summary.processed);
    println!("Framing errors:    {}", summary.metrics.framing_errors);
    println!("Forwarded:         {}", summary.metrics.forwarded);
    println!("Suppressed:        {}", summary.metrics.suppressed);
    println!("Send failures:     {}", summary.metrics.send_failures);
    println!("Subjects:          {}", summary.subjects);

    println!("\n=== Receive → Send Latency ===");
    println!("Samples:           {}", summary.latency.count);
    println!("Min latency:       {} ns", summary.latency.min_ns);
    println!("Max latency:       {} ns", summary.latency.max_ns);
    println!("Avg latency:       {} ns", summary.latency.avg_ns);
    println!("Median latency:    {} ns", summary.latency.median_ns);
    println!("P99 latency:       {} ns", summary.latency.p99_ns);
    println!("P99.9 latency:     {} ns", summary.latency.p999_ns);

    if !pipeline.forwarder().with_sink(|s| s.is_connected()) {
        warn!("destination {} was disconnected at shutdown", cfg.destination);
    }
    if let Some(path) = &cfg.send_log {
        let rows = pipeline
            .forwarder()
            .finish_send_log()
            .with_context(|| format!("writing send log {}", path.display()))?;
        info!("send log: {rows} rows → {}", path.display());
    }
    if let Some(path) = &cfg.summary {
        summary
            .write_json(path)
            .with_context(|| format!("writing summary {}", path.display()))?;
    }
    Ok(())
}
