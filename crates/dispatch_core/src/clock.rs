//! Wall-clock abstraction and the sweep tick queue.
//!
//! Every timeout in the engine is a comparison of `now` against a stored
//! timestamp, so tests drive time through [`ManualClock`] instead of sleeping.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Which periodic sweep a tick belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SweepKind {
    LongDistance,
    Reassignment,
    ScheduledRides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepTick {
    pub due_at: DateTime<Utc>,
    pub kind: SweepKind,
}

impl Ord for SweepTick {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by due time.
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

impl PartialOrd for SweepTick {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered queue of upcoming sweep ticks.
#[derive(Debug, Default)]
pub struct SweepQueue {
    ticks: BinaryHeap<SweepTick>,
}

impl SweepQueue {
    pub fn schedule(&mut self, kind: SweepKind, due_at: DateTime<Utc>) {
        self.ticks.push(SweepTick { due_at, kind });
    }

    /// Earliest due time, if anything is scheduled.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.ticks.peek().map(|tick| tick.due_at)
    }

    /// Pop the next tick if it is due at or before `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<SweepTick> {
        if self.ticks.peek()?.due_at > now {
            return None;
        }
        self.ticks.pop()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}
