/// Ingest → decode → book update → score → forward.
///
/// Architecture:
///   [receiver] → Ingress::handle() stamps t_recv, peeks the subject id
///        ↓ (one crossbeam bounded channel per worker, subject % workers)
///   [worker-N] → Pipeline::process() for every packet of its subjects
///        ↓
///   Forwarder (serialized connection) + LatencyRecorder (serialized file)
///
/// Every packet for a subject goes to the same worker, so one subject's book
/// and forwarding state are only ever touched by one thread, in arrival
/// order. The book keeps its own lock anyway for outside readers.
///
/// Backpressure: a full worker queue blocks the receiver. Each time a queue
/// is found full `queue_full` is bumped first, so stalls show up in metrics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use crate::error::{DecodeError, RelayError, RelayResult};
use crate::forwarder::{Forward, Forwarder, ScoreSink};
use crate::metrics::Metrics;
use crate::orderbook::BookRegistry;
use crate::recorder::LatencyRecorder;
use crate::score::{composite_score, to_real};
use crate::types::*;
use crate::wire;

const WORKER_POLL: Duration = Duration::from_millis(50);

/// Capability: consume one datagram.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, datagram: Vec<u8>) -> RelayResult<()>;
}

/// Steps of the per-packet state machine, in order. Each completed step is
/// traced at `trace` level with the subject id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Parsed,
    BookUpdated,
    Scored,
    ForwardDecided,
    Sent,
    Suppressed,
}

/// Terminal result of processing one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Framing error; the book was not touched.
    Dropped(DecodeError),
    Sent { score: i64, sample: LatencySample },
    Suppressed { subject_id: SubjectId, score: i64 },
    /// New score but the write failed. Nothing recorded.
    SendFailed { subject_id: SubjectId, score: i64 },
}

impl Outcome {
    /// The step at which the packet left the state machine. A dropped packet
    /// failed to reach `Parsed`; a failed send stopped after the decision.
    pub fn stage(&self) -> Stage {
        match self {
            Outcome::Dropped(_) => Stage::Parsed,
            Outcome::Sent { .. } => Stage::Sent,
            Outcome::Suppressed { .. } => Stage::Suppressed,
            Outcome::SendFailed { .. } => Stage::ForwardDecided,
        }
    }
}

/// All per-process state, constructed once and handed to the workers.
pub struct Pipeline<S: ScoreSink> {
    registry: Arc<BookRegistry>,
    forwarder: Arc<Forwarder<S>>,
    recorder: Arc<LatencyRecorder>,
    metrics: Arc<Metrics>,
    clock: quanta::Clock,
    status: bool,
}

impl<S: ScoreSink> Pipeline<S> {
    pub fn new(
        registry: Arc<BookRegistry>,
        forwarder: Arc<Forwarder<S>>,
        recorder: Arc<LatencyRecorder>,
        metrics: Arc<Metrics>,
        clock: quanta::Clock,
    ) -> Self {
        Self {
            registry,
            forwarder,
            recorder,
            metrics,
            clock,
            status: false,
        }
    }

    /// Print the operator status line for every forwarded score.
    pub fn with_status(mut self, status: bool) -> Self {
        self.status = status;
        self
    }

    /// Run one packet through the state machine.
    pub fn process(&self, datagram: &[u8], t_recv: Timestamp) -> Outcome {
        trace!(len = datagram.len(), stage = ?Stage::Received);
        let msg = match wire::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.inc_framing_error();
                warn!(len = datagram.len(), "dropping packet: {e}");
                return Outcome::Dropped(e);
            }
        };
        let t_parsed = now_ns(&self.clock);
        trace!(subject_id = msg.subject_id, stage = ?Stage::Parsed);

        let book = self.registry.get_or_create(msg.subject_id);
        let (applied, top) = book.apply_and_snapshot(&msg.updates);
        self.metrics
            .add_levels_dropped((msg.updates.len() - applied) as u64);
        let t_calc_start = now_ns(&self.clock);
        trace!(subject_id = msg.subject_id, stage = ?Stage::BookUpdated, applied);

        let score = composite_score(&top);
        let t_calc_end = now_ns(&self.clock);
        trace!(subject_id = msg.subject_id, stage = ?Stage::Scored, score);

        let out = ScoreMessage {
            subject_id: msg.subject_id,
            score,
        };
        let forward = self.forwarder.forward(out);
        trace!(subject_id = msg.subject_id, stage = ?Stage::ForwardDecided);
        match forward {
            Forward::Sent(t_sent) => {
                self.metrics.inc_forwarded();
                let sample = LatencySample {
                    subject_id: msg.subject_id,
                    t_recv,
                    t_parsed,
                    t_calc_start,
                    t_calc_end,
                    t_sent,
                    num_updates: msg.updates.len(),
                };
                if let Err(e) = self.recorder.record(&sample) {
                    warn!(subject_id = msg.subject_id, "latency record failed: {e}");
                }
                if self.status {
                    println!(
                        "SID={} Composite-score={} scaled={}",
                        msg.subject_id,
                        to_real(score),
                        score
                    );
                }
                Outcome::Sent { score, sample }
            }
            Forward::Suppressed => {
                self.metrics.inc_suppressed();
                debug!(subject_id = msg.subject_id, score, "unchanged, suppressed");
                Outcome::Suppressed {
                    subject_id: msg.subject_id,
                    score,
                }
            }
            Forward::Failed(_) => {
                self.metrics.inc_send_failure();
                Outcome::SendFailed {
                    subject_id: msg.subject_id,
                    score,
                }
            }
        }
    }

    pub fn registry(&self) -> &Arc<BookRegistry> {
        &self.registry
    }

    pub fn forwarder(&self) -> &Arc<Forwarder<S>> {
        &self.forwarder
    }

    pub fn recorder(&self) -> &Arc<LatencyRecorder> {
        &self.recorder
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn clock(&self) -> &quanta::Clock {
        &self.clock
    }
}

/// Inline, single-threaded handling on the caller's thread.
impl<S: ScoreSink> PacketHandler for Pipeline<S> {
    fn handle(&self, datagram: Vec<u8>) -> RelayResult<()> {
        let t_recv = now_ns(&self.clock);
        self.metrics.inc_received();
        match self.process(&datagram, t_recv) {
            Outcome::Dropped(e) => Err(e.into()),
            _ => Ok(()),
        }
    }
}

struct Job {
    datagram: Vec<u8>,
    t_recv: Timestamp,
}

/// Same subject → same worker.
#[inline(always)]
pub fn shard_for(subject_id: SubjectId, shards: usize) -> usize {
    subject_id as usize % shards.max(1)
}

/// Receiver-side handle onto the worker queues. Cheap to clone.
#[derive(Clone)]
pub struct Ingress {
    senders: Vec<Sender<Job>>,
    stop: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    clock: quanta::Clock,
}

impl PacketHandler for Ingress {
    fn handle(&self, datagram: Vec<u8>) -> RelayResult<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(RelayError::ShutDown);
        }
        let t_recv = now_ns(&self.clock);
        self.metrics.inc_received();

        // Too short to carry a subject id: any worker will reject it.
        let shard = wire::peek_subject(&datagram)
            .map(|sid| shard_for(sid, self.senders.len()))
            .unwrap_or(0);
        let tx = &self.senders[shard];

        match tx.try_send(Job { datagram, t_recv }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.metrics.inc_queue_full();
                tx.send(job).map_err(|_| RelayError::ShutDown)
            }
            Err(TrySendError::Disconnected(_)) => Err(RelayError::ShutDown),
        }
    }
}

/// Worker pool with one bounded queue per worker.
pub struct Dispatcher<S: ScoreSink + 'static> {
    pipeline: Arc<Pipeline<S>>,
    ingress: Ingress,
    workers: Vec<JoinHandle<u64>>,
    stop: Arc<AtomicBool>,
    drain: Arc<AtomicBool>,
}

impl<S: ScoreSink + 'static> Dispatcher<S> {
    pub fn start(pipeline: Arc<Pipeline<S>>, workers: usize, capacity: usize) -> RelayResult<Self> {
        if workers == 0 || capacity == 0 {
            return Err(RelayError::Config(format!(
                "workers ({workers}) and queue capacity ({capacity}) must be non-zero"
            )));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let drain = Arc::new(AtomicBool::new(false));

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = bounded::<Job>(capacity);
            senders.push(tx);

            let pipeline = Arc::clone(&pipeline);
            let stop = Arc::clone(&stop);
            let drain = Arc::clone(&drain);
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || run_worker(id, rx, &pipeline, &stop, &drain))?;
            handles.push(handle);
        }
        info!("dispatcher started: workers={workers} queue_capacity={capacity}");

        let ingress = Ingress {
            senders,
            stop: Arc::clone(&stop),
            metrics: Arc::clone(pipeline.metrics()),
            clock: pipeline.clock().clone(),
        };
        Ok(Self {
            pipeline,
            ingress,
            workers: handles,
            stop,
            drain,
        })
    }

    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline<S>> {
        &self.pipeline
    }

    /// Stop dequeuing now. Packets still queued are dropped and counted.
    /// Returns how many packets the workers processed.
    pub fn shutdown(self) -> u64 {
        self.stop.store(true, Ordering::Release);
        self.join()
    }

    /// Let the workers empty their queues, then stop.
    pub fn drain(self) -> u64 {
        self.drain.store(true, Ordering::Release);
        self.join()
    }

    fn join(self) -> u64 {
        drop(self.ingress);
        let mut processed = 0;
        for handle in self.workers {
            match handle.join() {
                Ok(n) => processed += n,
                Err(_) => warn!("worker panicked"),
            }
        }
        info!("dispatcher stopped: processed={processed}");
        processed
    }
}

fn run_worker<S: ScoreSink>(
    id: usize,
    rx: Receiver<Job>,
    pipeline: &Pipeline<S>,
    stop: &AtomicBool,
    drain: &AtomicBool,
) -> u64 {
    let mut processed = 0u64;
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match rx.recv_timeout(WORKER_POLL) {
            Ok(job) => {
                pipeline.process(&job.datagram, job.t_recv);
                processed += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                if drain.load(Ordering::Acquire) && rx.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let pending = rx.len() as u64;
    pipeline.metrics().add_dropped_on_shutdown(pending);
    debug!("worker-{id} exiting: processed={processed} dropped={pending}");
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use parking_lot::Mutex;
    use std::io::Write;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct VecSink(Vec<ScoreMessage>);

    impl ScoreSink for VecSink {
        fn write_all(&mut self, buf: &[u8]) -> Result<(), SendError> {
            let mut frame = [0u8; wire::SCORE_LEN];
            frame.copy_from_slice(buf);
            self.0.push(wire::decode_score(&frame));
            Ok(())
        }
    }

    /// Destination that is gone for good.
    struct DownSink;

    impl ScoreSink for DownSink {
        fn write_all(&mut self, _buf: &[u8]) -> Result<(), SendError> {
            Err(SendError::Disconnected)
        }
    }

    fn pipeline() -> (Pipeline<VecSink>, SharedBuf) {
        pipeline_with(VecSink::default())
    }

    fn pipeline_with<S: ScoreSink>(sink: S) -> (Pipeline<S>, SharedBuf) {
        let clock = quanta::Clock::new();
        let buf = SharedBuf::default();
        let pipeline = Pipeline::new(
            Arc::new(BookRegistry::new()),
            Arc::new(Forwarder::new(sink, clock.clone())),
            Arc::new(LatencyRecorder::new(Box::new(buf.clone()), true)),
            Arc::new(Metrics::new()),
            clock,
        );
        (pipeline, buf)
    }

    fn packet(subject_id: SubjectId, updates: Vec<LevelUpdate>) -> Vec<u8> {
        wire::encode_update(&UpdateMessage { subject_id, updates }).unwrap()
    }

    fn top(dv: i64, dq: u32, sv: i64, sq: u32) -> Vec<LevelUpdate> {
        vec![
            LevelUpdate { level: 0, side: Side::Demand, value: dv, volume: dq },
            LevelUpdate { level: 0, side: Side::Supply, value: sv, volume: sq },
        ]
    }

    #[test]
    fn test_process_sends_and_records() {
        let (p, buf) = pipeline();
        let raw = packet(42, top(150_000_000_000, 100, 151_000_000_000, 200));

        let outcome = p.process(&raw, 1);
        let Outcome::Sent { score, sample } = outcome.clone() else {
            panic!("expected send, got {outcome:?}");
        };
        assert_eq!(score, 150_333_333_333);
        assert_eq!(sample.subject_id, 42);
        assert_eq!(sample.t_recv, 1);
        assert_eq!(sample.num_updates, 2);
        assert!(sample.t_parsed <= sample.t_calc_start);
        assert!(sample.t_calc_start <= sample.t_calc_end);
        assert!(sample.t_calc_end <= sample.t_sent);

        let sent = p.forwarder().with_sink(|s| s.0.clone());
        assert_eq!(sent, vec![ScoreMessage { subject_id: 42, score: 150_333_333_333 }]);
        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_identical_score_is_suppressed_without_record() {
        let (p, buf) = pipeline();
        let raw = packet(42, top(150_000_000_000, 100, 151_000_000_000, 200));
        assert_eq!(p.process(&raw, 0).stage(), Stage::Sent);
        assert_eq!(p.process(&raw, 0).stage(), Stage::Suppressed);

        assert_eq!(p.forwarder().with_sink(|s| s.0.len()), 1);
        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
        let m = p.metrics().snapshot();
        assert_eq!((m.forwarded, m.suppressed), (1, 1));
    }

    #[test]
    fn test_truncated_packet_touches_nothing() {
        let (p, _) = pipeline();
        let mut raw = packet(42, top(1, 1, 2, 2));
        raw[8..10].copy_from_slice(&5u16.to_be_bytes());

        let outcome = p.process(&raw, 0);
        assert!(matches!(outcome, Outcome::Dropped(DecodeError::Truncated { .. })));
        assert_eq!(outcome.stage(), Stage::Parsed);
        assert!(p.registry().get(42).is_none());
        assert_eq!(p.metrics().snapshot().framing_errors, 1);
    }

    #[test]
    fn test_failed_send_stops_after_decision() {
        let (p, buf) = pipeline_with(DownSink);
        let raw = packet(42, top(150_000_000_000, 100, 151_000_000_000, 200));

        let outcome = p.process(&raw, 0);
        assert_eq!(outcome, Outcome::SendFailed { subject_id: 42, score: 150_333_333_333 });
        assert_eq!(outcome.stage(), Stage::ForwardDecided);
        // Not recorded, so the same score is attempted again.
        assert_eq!(p.process(&raw, 0).stage(), Stage::ForwardDecided);
        assert_eq!(p.forwarder().detector().last_forwarded(42), None);
        assert_eq!(p.metrics().snapshot().send_failures, 2);
        assert!(buf.0.lock().is_empty());
    }

    #[test]
    fn test_out_of_range_levels_still_score() {
        let (p, _) = pipeline();
        let mut updates = top(10, 0, 20, 0);
        updates.push(LevelUpdate { level: 10, side: Side::Demand, value: 999, volume: 9 });

        let outcome = p.process(&packet(5, updates), 0);
        assert!(matches!(outcome, Outcome::Sent { score: 15, .. }));
        assert_eq!(p.metrics().snapshot().levels_dropped, 1);
    }

    #[test]
    fn test_handle_reports_framing_error() {
        let (p, _) = pipeline();
        assert!(matches!(p.handle(vec![0; 3]), Err(RelayError::Decode(_))));
        assert_eq!(p.metrics().snapshot().packets_received, 1);
    }

    #[test]
    fn test_shard_for_is_stable() {
        assert_eq!(shard_for(42, 4), 2);
        assert_eq!(shard_for(42, 4), shard_for(42, 4));
        assert_eq!(shard_for(7, 0), 0);
    }

    #[test]
    fn test_dispatcher_drain_processes_everything() {
        let (p, _) = pipeline();
        let dispatcher = Dispatcher::start(Arc::new(p), 4, 8).unwrap();
        let ingress = dispatcher.ingress();
        for i in 0..200u32 {
            let sid = i % 10;
            ingress
                .handle(packet(sid, top(100 + i as i64, 1, 200, 1)))
                .unwrap();
        }
        drop(ingress);
        let p = Arc::clone(dispatcher.pipeline());
        assert_eq!(dispatcher.drain(), 200);

        // Last packet per subject wins: subject s last saw i = 190 + s.
        for sid in 0..10u32 {
            let expected = (100 + 190 + sid as i64 + 200) / 2;
            assert_eq!(p.forwarder().detector().last_forwarded(sid), Some(expected));
        }
        assert_eq!(p.metrics().snapshot().forwarded, 200);
    }

    #[test]
    fn test_ingress_after_shutdown_is_rejected() {
        let (p, _) = pipeline();
        let dispatcher = Dispatcher::start(Arc::new(p), 2, 4).unwrap();
        let ingress = dispatcher.ingress();
        dispatcher.shutdown();
        assert!(matches!(ingress.handle(vec![0; 24]), Err(RelayError::ShutDown)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let (p, _) = pipeline();
        assert!(matches!(
            Dispatcher::start(Arc::new(p), 0, 4),
            Err(RelayError::Config(_))
        ));
    }
}
