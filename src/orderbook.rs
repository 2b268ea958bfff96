/// Fixed-depth per-subject book and the registry that owns them.
///
/// Design choices:
/// - Each side is a plain `[Level; 10]`. Level rank is assigned by the
///   sender, never derived from value, so there is nothing to sort.
/// - A level is stored as one `Level` value, so value and volume are always
///   written and read together.
/// - Each book sits behind its own `parking_lot::Mutex`. The registry map
///   lock is only held for lookup-or-insert, never while a book is mutated.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::*;

/// Top-of-book state of both sides, copied out under one lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopOfBook {
    pub demand: Level,
    pub supply: Level,
}

/// Ten demand and ten supply levels for one subject.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    demand: [Level; MAX_LEVELS],
    supply: [Level; MAX_LEVELS],
}

impl OrderBook {
    /// Create a zeroed book.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite one level. Levels outside 0..10 are dropped silently.
    #[inline(always)]
    pub fn apply_update(&mut self, level: u8, side: Side, value: i64, volume: u32) -> bool {
        let idx = level as usize;
        if idx >= MAX_LEVELS {
            return false;
        }
        let slot = match side {
            Side::Demand => &mut self.demand[idx],
            Side::Supply => &mut self.supply[idx],
        };
        *slot = Level { value, volume };
        true
    }

    /// Apply every update of a message. Returns how many landed in range.
    #[inline]
    pub fn apply_message(&mut self, updates: &[LevelUpdate]) -> usize {
        let mut applied = 0;
        for u in updates {
            if self.apply_update(u.level, u.side, u.value, u.volume) {
                applied += 1;
            }
        }
        applied
    }

    /// The (value, volume) pair at a level, zero when out of range.
    #[inline(always)]
    pub fn level(&self, side: Side, level: usize) -> Level {
        if level >= MAX_LEVELS {
            return Level::default();
        }
        match side {
            Side::Demand => self.demand[level],
            Side::Supply => self.supply[level],
        }
    }

    #[inline(always)]
    pub fn level_value(&self, side: Side, level: usize) -> i64 {
        self.level(side, level).value
    }

    #[inline(always)]
    pub fn level_volume(&self, side: Side, level: usize) -> u32 {
        self.level(side, level).volume
    }

    #[inline(always)]
    pub fn top(&self) -> TopOfBook {
        TopOfBook {
            demand: self.demand[0],
            supply: self.supply[0],
        }
    }
}

/// Shared handle to one subject's book. Cloning is cheap and every clone
/// points at the same book for the life of the registry.
#[derive(Debug, Clone, Default)]
pub struct BookHandle {
    inner: Arc<Mutex<OrderBook>>,
}

impl BookHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single level update under the book lock.
    #[inline]
    pub fn apply_update(&self, level: u8, side: Side, value: i64, volume: u32) -> bool {
        self.inner.lock().apply_update(level, side, value, volume)
    }

    /// Apply a whole message and snapshot the top of book in the same
    /// critical section, so a score never sees half a message.
    #[inline]
    pub fn apply_and_snapshot(&self, updates: &[LevelUpdate]) -> (usize, TopOfBook) {
        let mut book = self.inner.lock();
        let applied = book.apply_message(updates);
        (applied, book.top())
    }

    #[inline]
    pub fn level(&self, side: Side, level: usize) -> Level {
        self.inner.lock().level(side, level)
    }

    #[inline]
    pub fn level_value(&self, side: Side, level: usize) -> i64 {
        self.level(side, level).value
    }

    #[inline]
    pub fn level_volume(&self, side: Side, level: usize) -> u32 {
        self.level(side, level).volume
    }

    #[inline]
    pub fn top(&self) -> TopOfBook {
        self.inner.lock().top()
    }
}

/// Subject id → book, created lazily on first reference.
#[derive(Debug, Default)]
pub struct BookRegistry {
    books: DashMap<SubjectId, BookHandle>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a subject's book, inserting a zeroed one on first use.
    /// Only the map shard is locked here.
    pub fn get_or_create(&self, subject_id: SubjectId) -> BookHandle {
        if let Some(book) = self.books.get(&subject_id) {
            return book.value().clone();
        }
        self.books.entry(subject_id).or_default().value().clone()
    }

    /// Existing book only.
    pub fn get(&self, subject_id: SubjectId) -> Option<BookHandle> {
        self.books.get(&subject_id).map(|b| b.value().clone())
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
