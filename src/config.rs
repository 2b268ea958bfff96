/// Command line and validated relay configuration.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{RelayError, RelayResult};

const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const MAX_DEFAULT_WORKERS: usize = 8;

#[derive(Parser, Debug, Clone)]
#[command(name = "score_relay", version, about = "Composite score relay")]
pub struct Cli {
    /// Multicast group to join.
    pub mcast_ip: Ipv4Addr,
    /// Multicast port.
    pub mcast_port: u16,
    /// IPv4 address of the local interface to join on.
    pub interface: Ipv4Addr,
    /// Destination host for composite scores.
    pub dest_host: String,
    /// Destination port.
    pub dest_port: u16,

    /// Worker threads (subjects are sharded across them).
    #[arg(long)]
    pub workers: Option<usize>,
    /// Bounded queue size per worker.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
    /// Latency trace CSV (appended).
    #[arg(long, default_value = "test_results/latency_trace.csv")]
    pub latency_log: PathBuf,
    /// Dump the send log here at shutdown.
    #[arg(long)]
    pub send_log: Option<PathBuf>,
    /// Write a JSON run summary here at shutdown.
    #[arg(long)]
    pub summary: Option<PathBuf>,
    /// Print a status line per forwarded score.
    #[arg(long, default_value_t = false)]
    pub status: bool,
    /// Stop after this many seconds instead of waiting for ENTER.
    #[arg(long)]
    pub run_for_secs: Option<u64>,
    /// Replay a packet capture instead of joining the multicast group.
    #[arg(long)]
    pub replay: Option<PathBuf>,
}

/// Where packets come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Multicast {
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
    },
    Replay(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub source: Source,
    pub destination: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub latency_log: PathBuf,
    pub send_log: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub status: bool,
    pub run_for: Option<Duration>,
}

/// What ends a multicast run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopWhen {
    /// `--run-for-secs` elapsed.
    After(Duration),
    /// A line (or EOF) on an interactive stdin.
    Enter,
    /// Detached from a terminal: run until the process is killed.
    Killed,
}

impl RelayConfig {
    /// A closed or redirected stdin must not end the run on its own.
    pub fn stop_when(&self, stdin_is_terminal: bool) -> StopWhen {
        match self.run_for {
            Some(d) => StopWhen::After(d),
            None if stdin_is_terminal => StopWhen::Enter,
            None => StopWhen::Killed,
        }
    }
}

impl Cli {
    pub fn into_config(self) -> RelayResult<RelayConfig> {
        let workers = self.workers.unwrap_or_else(default_workers);
        if workers == 0 {
            return Err(RelayError::Config("--workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("--queue-capacity must be at least 1".into()));
        }
        let source = match self.replay {
            Some(path) => Source::Replay(path),
            None => Source::Multicast {
                group: self.mcast_ip,
                port: self.mcast_port,
                interface: self.interface,
            },
        };
        Ok(RelayConfig {
            source,
            destination: format!("{}:{}", self.dest_host, self.dest_port),
            workers,
            queue_capacity: self.queue_capacity,
            latency_log: self.latency_log,
            send_log: self.send_log,
            summary: self.summary,
            status: self.status,
            run_for: self.run_for_secs.map(Duration::from_secs),
        })
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}
