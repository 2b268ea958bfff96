/// Pipeline counters and the end-of-run summary.
///
/// Counters are plain atomics bumped on the hot path; a snapshot copies
/// them for printing or for the JSON summary.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::recorder::LatencySummary;

/// Countable pipeline events. All counters are monotonic and Relaxed.
#[derive(Debug, Default)]
pub struct Metrics {
    pub packets_received: AtomicU64,
    pub framing_errors: AtomicU64,
    pub levels_dropped: AtomicU64,
    pub forwarded: AtomicU64,
    pub suppressed: AtomicU64,
    pub send_failures: AtomicU64,
    pub queue_full: AtomicU64,
    pub dropped_on_shutdown: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub framing_errors: u64,
    pub levels_dropped: u64,
    pub forwarded: u64,
    pub suppressed: u64,
    pub send_failures: u64,
    pub queue_full: u64,
    pub dropped_on_shutdown: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn add_levels_dropped(&self, n: u64) {
        if n > 0 {
            self.levels_dropped.fetch_add(n, Ordering::Relaxed);
        }
    }
    #[inline]
    pub fn inc_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn add_dropped_on_shutdown(&self, n: u64) {
        if n > 0 {
            self.dropped_on_shutdown.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            levels_dropped: self.levels_dropped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::Relaxed),
        }
    }
}

/// End-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub subjects: usize,
    pub metrics: MetricsSnapshot,
    pub latency: LatencySummary,
}

impl RunSummary {
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        writeln!(out)?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = Metrics::new();
        m.inc_received();
        m.inc_received();
        m.inc_framing_error();
        m.add_levels_dropped(3);
        m.add_levels_dropped(0);
        m.inc_forwarded();
        let s = m.snapshot();
        assert_eq!(s.packets_received, 2);
        assert_eq!(s.framing_errors, 1);
        assert_eq!(s.levels_dropped, 3);
        assert_eq!(s.forwarded, 1);
        assert_eq!(s.suppressed, 0);
    }

    #[test]
    fn test_summary_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = RunSummary {
            processed: 4,
            subjects: 2,
            metrics: MetricsSnapshot { forwarded: 3, ..Default::default() },
            latency: LatencySummary::default(),
        };
        summary.write_json(&path).unwrap();

        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["processed"], 4);
        assert_eq!(v["metrics"]["forwarded"], 3);
        assert_eq!(v["latency"]["count"], 0);
    }
}
