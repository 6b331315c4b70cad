//! TTL Timers
//!
//! Orphaned instances with a duration TTL are not destroyed immediately;
//! their destruction is parked on a deadline queue and confirmed when the
//! deadline passes. The engine never blocks waiting on time — the host
//! pumps `Ecosystem::run_due_timers` (directly or from its own event loop)
//! and due destructions are confirmed then.
//!
//! Cancellation is generation-based: an instance bumps its destruction
//! generation whenever a new dependent attaches, so a deadline entry carrying
//! a stale generation is ignored when it fires.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::graph::NodeKey;

/// A time source. The engine only ever asks "what time is it now".
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Used by tests to drive TTL
/// expiration deterministically.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// A clock frozen at its creation instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    key: NodeKey,
    generation: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Deadline queue for pending destructions.
pub(crate) struct Timers {
    clock: Arc<dyn Clock>,
    heap: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    seq: AtomicU64,
}

impl Timers {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Park a destruction deadline for `key` under the given generation.
    pub(crate) fn schedule(&self, key: NodeKey, generation: u64, delay: Duration) {
        let entry = TimerEntry {
            due: self.clock.now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            key,
            generation,
        };
        self.heap.lock().push(Reverse(entry));
    }

    /// Pop every entry whose deadline has passed, in due order. Stale
    /// generations are the caller's concern — entries are returned as-is.
    pub(crate) fn drain_due(&self) -> Vec<(NodeKey, u64)> {
        let now = self.clock.now();
        let mut due = Vec::new();

        let mut heap = self.heap.lock();
        while heap.peek().is_some_and(|Reverse(entry)| entry.due <= now) {
            let Reverse(entry) = heap.pop().expect("peeked entry vanished");
            due.push((entry.key, entry.generation));
        }
        due
    }

    /// Whether any deadline is parked.
    pub(crate) fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        let before = clock.now();
        assert_eq!(clock.now(), before);

        clock.advance(Duration::from_millis(50));
        assert_eq!(clock.now(), before + Duration::from_millis(50));
    }

    #[test]
    fn drain_due_returns_only_expired_entries() {
        let clock = Arc::new(ManualClock::new());
        let timers = Timers::new(Arc::clone(&clock) as Arc<dyn Clock>);

        timers.schedule(NodeKey::new("soon"), 1, Duration::from_millis(10));
        timers.schedule(NodeKey::new("later"), 1, Duration::from_millis(100));

        assert!(timers.drain_due().is_empty());

        clock.advance(Duration::from_millis(20));
        assert_eq!(timers.drain_due(), vec![(NodeKey::new("soon"), 1)]);
        assert!(!timers.is_empty());

        clock.advance(Duration::from_millis(100));
        assert_eq!(timers.drain_due(), vec![(NodeKey::new("later"), 1)]);
        assert!(timers.is_empty());
    }

    #[test]
    fn entries_drain_in_due_order() {
        let clock = Arc::new(ManualClock::new());
        let timers = Timers::new(Arc::clone(&clock) as Arc<dyn Clock>);

        timers.schedule(NodeKey::new("second"), 1, Duration::from_millis(20));
        timers.schedule(NodeKey::new("first"), 1, Duration::from_millis(10));

        clock.advance(Duration::from_millis(30));
        let due: Vec<String> = timers
            .drain_due()
            .into_iter()
            .map(|(key, _)| key.as_str().to_string())
            .collect();
        assert_eq!(due, vec!["first", "second"]);
    }
}
