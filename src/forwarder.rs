/// Change-only forwarding of composite scores.
///
/// The last forwarded score per subject lives in a `DashMap`. The check, the
/// send and the record all run under that subject's entry guard, so two
/// workers can never both decide "changed" for the same score. The score is
/// only recorded once the write succeeded; a failed send leaves the subject
/// eligible for the next score, even an identical one.

use std::convert::Infallible;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{RelayError, RelayResult, SendError};
use crate::types::*;
use crate::wire;

const RECONNECT_MIN: Duration = Duration::from_millis(50);
const RECONNECT_MAX: Duration = Duration::from_secs(1);

/// Per-subject last-forwarded scores.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: DashMap<SubjectId, i64>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-set. True (and `score` recorded) iff the subject has
    /// never been forwarded or its last forwarded score differs.
    pub fn should_forward_and_record(&self, subject_id: SubjectId, score: i64) -> bool {
        self.forward_with(subject_id, score, || Ok::<(), Infallible>(()))
            .is_some()
    }

    /// Run `send` if `score` is new for the subject, holding the subject's
    /// entry for the whole call. The score is recorded only when `send`
    /// returns Ok. `None` means suppressed.
    pub fn forward_with<T, E>(
        &self,
        subject_id: SubjectId,
        score: i64,
        send: impl FnOnce() -> Result<T, E>,
    ) -> Option<Result<T, E>> {
        match self.last.entry(subject_id) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == score {
                    return None;
                }
                let result = send();
                if result.is_ok() {
                    entry.insert(score);
                }
                Some(result)
            }
            Entry::Vacant(entry) => {
                let result = send();
                if result.is_ok() {
                    entry.insert(score);
                }
                Some(result)
            }
        }
    }

    pub fn last_forwarded(&self, subject_id: SubjectId) -> Option<i64> {
        self.last.get(&subject_id).map(|s| *s.value())
    }

    pub fn subjects(&self) -> usize {
        self.last.len()
    }
}

/// Downstream byte sink: a blocking full write that either lands every byte
/// or fails.
pub trait ScoreSink: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SendError>;
}

/// Stream connection to the destination, with lazy reconnect after failure.
pub struct TcpSink {
    addr: String,
    stream: Option<TcpStream>,
    backoff: Duration,
    next_attempt: Option<Instant>,
}

impl TcpSink {
    /// Connect once. Failing here is fatal to the caller: there is no data
    /// path without a destination.
    pub fn connect(addr: &str) -> RelayResult<Self> {
        let stream = open_stream(addr).map_err(|source| RelayError::ConnectFailed {
            addr: addr.to_string(),
            source,
        })?;
        info!("connected to destination {addr}");
        Ok(Self {
            addr: addr.to_string(),
            stream: Some(stream),
            backoff: RECONNECT_MIN,
            next_attempt: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn reconnect(&mut self) -> Result<(), SendError> {
        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return Err(SendError::Disconnected);
            }
        }
        match open_stream(&self.addr) {
            Ok(stream) => {
                info!("reconnected to destination {}", self.addr);
                self.stream = Some(stream);
                self.backoff = RECONNECT_MIN;
                self.next_attempt = None;
                Ok(())
            }
            Err(e) => {
                warn!("reconnect to {} failed: {e}; next try in {:?}", self.addr, self.backoff);
                self.next_attempt = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(RECONNECT_MAX);
                Err(SendError::Disconnected)
            }
        }
    }
}

fn open_stream(addr: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl ScoreSink for TcpSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SendError> {
        if self.stream.is_none() {
            self.reconnect()?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(SendError::Disconnected);
        };
        // io::Write::write_all loops over partial writes and EINTR.
        if let Err(e) = stream.write_all(buf) {
            self.stream = None;
            self.next_attempt = None;
            return Err(SendError::Io(e));
        }
        Ok(())
    }
}

/// Result of one forwarding decision.
#[derive(Debug)]
pub enum Forward {
    /// Written downstream at the given timestamp.
    Sent(Timestamp),
    /// Score unchanged since the last successful send.
    Suppressed,
    /// Score was new but the write failed; nothing was recorded.
    Failed(SendError),
}

pub const SEND_LOG_HEADER: &str = "subject_id,scaled_composite_score,timestamp_ns";

/// CSV log of successful sends, written as they happen.
pub struct SendLog {
    out: Box<dyn Write + Send>,
    rows: u64,
}

impl SendLog {
    /// Start a log on any writer; the header goes out immediately.
    pub fn new(mut out: Box<dyn Write + Send>) -> io::Result<Self> {
        writeln!(out, "{SEND_LOG_HEADER}")?;
        Ok(Self { out, rows: 0 })
    }

    /// Create (truncate) a log file, making parent directories as needed.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        Self::new(Box::new(BufWriter::new(File::create(path)?)))
    }

    fn append(&mut self, r: &SendRecord) -> io::Result<()> {
        writeln!(self.out, "{},{},{}", r.subject_id, r.score, r.timestamp_ns)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

/// Change detector + serialized downstream connection + optional send log.
pub struct Forwarder<S: ScoreSink> {
    detector: ChangeDetector,
    sink: Mutex<S>,
    send_log: Mutex<Option<SendLog>>,
    clock: quanta::Clock,
}

impl<S: ScoreSink> Forwarder<S> {
    pub fn new(sink: S, clock: quanta::Clock) -> Self {
        Self {
            detector: ChangeDetector::new(),
            sink: Mutex::new(sink),
            send_log: Mutex::new(None),
            clock,
        }
    }

    /// Append a row to `log` for every successful send.
    pub fn with_send_log(self, log: SendLog) -> Self {
        *self.send_log.lock() = Some(log);
        self
    }

    /// Forward `msg` if its score changed for that subject.
    pub fn forward(&self, msg: ScoreMessage) -> Forward {
        match self
            .detector
            .forward_with(msg.subject_id, msg.score, || self.send(&msg))
        {
            None => Forward::Suppressed,
            Some(Ok(t_sent)) => Forward::Sent(t_sent),
            Some(Err(e)) => {
                error!(subject_id = msg.subject_id, "send failed: {e}");
                Forward::Failed(e)
            }
        }
    }

    /// Encode and write one score record. Sends are serialized across
    /// subjects because they share one connection.
    pub fn send(&self, msg: &ScoreMessage) -> Result<Timestamp, SendError> {
        let frame = wire::encode_score(msg);
        self.sink.lock().write_all(&frame)?;
        let t_sent = now_ns(&self.clock);
        if let Some(log) = self.send_log.lock().as_mut() {
            let record = SendRecord {
                subject_id: msg.subject_id,
                score: msg.score,
                timestamp_ns: t_sent,
            };
            if let Err(e) = log.append(&record) {
                warn!(subject_id = msg.subject_id, "send log write failed: {e}");
            }
        }
        Ok(t_sent)
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Run `f` against the sink, e.g. to inspect a test sink.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut sink = self.sink.lock();
        f(&mut *sink)
    }

    /// Flush the send log. Returns the rows written, 0 without a log.
    pub fn finish_send_log(&self) -> io::Result<u64> {
        match self.send_log.lock().as_mut() {
            Some(log) => {
                log.out.flush()?;
                Ok(log.rows)
            }
            None => Ok(0),
        }
    }
}
