/// Latency recorder.
///
/// Appends one CSV row per forwarded message and flushes after every row:
/// this is a diagnostic path and a row that never hits storage is useless.
/// Rows appear in the order `record` was called. Concurrent callers are
/// serialized by one lock, so rows never interleave mid-line.
///
/// The recorder also keeps receive-to-send statistics for the run summary.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::LatencySample;

pub const LATENCY_HEADER: &str =
    "subject_id,t_recv,t_parsed,t_calc_start,t_calc_end,t_sent,num_updates";

struct Inner {
    out: Box<dyn Write + Send>,
    header_pending: bool,
    stats: LatencyStats,
}

pub struct LatencyRecorder {
    inner: Mutex<Inner>,
}

impl LatencyRecorder {
    /// Record into any writer. `fresh` means the destination is empty and
    /// needs the header row before the first record.
    pub fn new(out: Box<dyn Write + Send>, fresh: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                out,
                header_pending: fresh,
                stats: LatencyStats::new(),
            }),
        }
    }

    /// Open (or create) an append-only CSV file. The header is written only
    /// if the file is empty.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        Ok(Self::new(Box::new(BufWriter::new(file)), fresh))
    }

    /// Append one sample and flush.
    pub fn record(&self, s: &LatencySample) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.header_pending {
            writeln!(inner.out, "{LATENCY_HEADER}")?;
            inner.header_pending = false;
        }
        writeln!(
            inner.out,
            "{},{},{},{},{},{},{}",
            s.subject_id, s.t_recv, s.t_parsed, s.t_calc_start, s.t_calc_end, s.t_sent, s.num_updates
        )?;
        inner.out.flush()?;
        inner.stats.record(s.total_ns());
        Ok(())
    }

    pub fn summary(&self) -> LatencySummary {
        self.inner.lock().stats.summary()
    }
}

/// Samples kept for percentiles. Older samples are overwritten, so the
/// percentiles describe the most recent window while count, min, max and
/// average cover the whole run.
pub const LATENCY_WINDOW: usize = 65_536;

/// Receive-to-send latency statistics in bounded memory.
pub struct LatencyStats {
    pub count: u64,
    pub total_latency_ns: u64,
    pub min_latency_ns: u64,
    pub max_latency_ns: u64,
    /// Ring of the last `window` samples.
    recent: Vec<u64>,
    window: usize,
    next: usize,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::with_window(LATENCY_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            count: 0,
            total_latency_ns: 0,
            min_latency_ns: u64::MAX,
            max_latency_ns: 0,
            recent: Vec::with_capacity(window.min(8192)),
            window,
            next: 0,
        }
    }

    #[inline(always)]
    pub fn record(&mut self, latency_ns: u64) {
        self.count += 1;
        self.total_latency_ns = self.total_latency_ns.saturating_add(latency_ns);
        self.min_latency_ns = self.min_latency_ns.min(latency_ns);
        self.max_latency_ns = self.max_latency_ns.max(latency_ns);
        if self.recent.len() < self.window {
            self.recent.push(latency_ns);
        } else {
            self.recent[self.next] = latency_ns;
        }
        self.next = (self.next + 1) % self.window;
    }

    /// Samples currently held for percentiles.
    pub fn retained(&self) -> usize {
        self.recent.len()
    }

    pub fn avg_latency_ns(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }
        self.total_latency_ns / self.count
    }

    pub fn percentile(&self, p: f64) -> u64 {
        percentile_of(&self.sorted(), p)
    }

    pub fn median(&self) -> u64 {
        self.percentile(50.0)
    }

    /// One sort of the window serves every percentile.
    pub fn summary(&self) -> LatencySummary {
        let sorted = self.sorted();
        LatencySummary {
            count: self.count,
            min_ns: if self.count == 0 { 0 } else { self.min_latency_ns },
            max_ns: self.max_latency_ns,
            avg_ns: self.avg_latency_ns(),
            median_ns: percentile_of(&sorted, 50.0),
            p99_ns: percentile_of(&sorted, 99.0),
            p999_ns: percentile_of(&sorted, 99.9),
        }
    }

    fn sorted(&self) -> Vec<u64> {
        let mut sorted = self.recent.clone();
        sorted.sort_unstable();
        sorted
    }
}

fn percentile_of(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
    pub median_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
}
