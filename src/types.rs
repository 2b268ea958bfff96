/// Core types for the composite score relay.
/// Everything on the hot path is small and Copy; only `UpdateMessage` owns a Vec.

use serde::Serialize;

/// Depth of each book side. Level 0 is top-of-book.
pub const MAX_LEVELS: usize = 10;

/// Fixed-point scale: real value = stored / SCALE.
pub const SCALE: i64 = 1_000_000_000;

/// Subject (instrument) identifier as carried on the wire.
pub type SubjectId = u32;

/// Monotonic nanoseconds from the process clock. Not comparable across hosts.
pub type Timestamp = u64;

/// Current checkpoint timestamp from a shared clock.
#[inline(always)]
pub fn now_ns(clock: &quanta::Clock) -> Timestamp {
    clock.delta_as_nanos(0, clock.raw())
}

/// Side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    Demand = 0,
    Supply = 1,
}

impl Side {
    /// Wire tag to side. Anything other than 0 lands on the supply side,
    /// which is how the book has always treated the tag.
    #[inline(always)]
    pub fn from_wire(tag: u8) -> Self {
        if tag == 0 {
            Side::Demand
        } else {
            Side::Supply
        }
    }

    #[inline(always)]
    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// One depth slot of a book side: scaled value and unit volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Level {
    pub value: i64,
    pub volume: u32,
}

/// A single level overwrite carried by an update packet.
/// `level` is kept raw: range checking is the book's job, not the codec's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelUpdate {
    pub level: u8,
    pub side: Side,
    pub value: i64,
    pub volume: u32,
}

/// A decoded update packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub subject_id: SubjectId,
    pub updates: Vec<LevelUpdate>,
}

/// Outbound score record, 12 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreMessage {
    pub subject_id: SubjectId,
    pub score: i64,
}

/// Pipeline checkpoints for one forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencySample {
    pub subject_id: SubjectId,
    pub t_recv: Timestamp,
    pub t_parsed: Timestamp,
    pub t_calc_start: Timestamp,
    pub t_calc_end: Timestamp,
    pub t_sent: Timestamp,
    pub num_updates: usize,
}

impl LatencySample {
    /// Receive-to-send latency in nanoseconds.
    #[inline(always)]
    pub fn total_ns(&self) -> u64 {
        self.t_sent.saturating_sub(self.t_recv)
    }
}

/// One successful downstream send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SendRecord {
    pub subject_id: SubjectId,
    pub score: i64,
    pub timestamp_ns: Timestamp,
}
