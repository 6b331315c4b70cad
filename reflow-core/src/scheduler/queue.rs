//! The Job Queue
//!
//! An ordered queue of pending jobs, drained to completion before control
//! returns to the caller. The queue itself is a sorted vector; insertion
//! position is found by binary search over the ordering key, so scheduling
//! is amortized logarithmic rather than a full linear scan.
//!
//! The flush loop lives in the ecosystem (jobs need access to the registry
//! and graph); this type owns the ordering, the re-entrancy flag, and
//! cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::job::{Job, JobKind};
use crate::graph::NodeKey;

/// The pending-work queue for one ecosystem.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queue: Mutex<Vec<Job>>,
    flushing: AtomicBool,
    seq: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a job at its ordered position.
    pub(crate) fn schedule(&self, kind: JobKind) {
        trace!(job = ?kind, "scheduling");
        let job = Job {
            kind,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let key = job.ordering_key();

        let mut queue = self.queue.lock();
        let position = queue.partition_point(|pending| pending.ordering_key() <= key);
        queue.insert(position, job);
    }

    /// Place a job at the very front of the queue, bypassing ordering.
    /// Used for work that must run "now" relative to an active flush.
    pub(crate) fn push_front(&self, kind: JobKind) {
        trace!(job = ?kind, "scheduling at front");
        let job = Job {
            kind,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.queue.lock().insert(0, job);
    }

    /// Pop the highest-priority job, re-reading the queue each call so jobs
    /// enqueued mid-flush are picked up.
    pub(crate) fn pop(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    /// Try to claim the flush loop. Returns `false` when a flush is already
    /// running — the outer loop will drain whatever we scheduled.
    pub(crate) fn begin_flush(&self) -> bool {
        !self.flushing.swap(true, Ordering::SeqCst)
    }

    /// Release the flush loop.
    pub(crate) fn end_flush(&self) {
        self.flushing.store(false, Ordering::SeqCst);
    }

    /// Whether a flush is currently draining the queue.
    pub(crate) fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Remove a pending evaluation job for the given node, if any. Used when
    /// an instance is destroyed with work still queued.
    pub(crate) fn cancel_evaluation(&self, key: &NodeKey) {
        self.queue.lock().retain(|job| {
            !matches!(&job.kind, JobKind::EvaluateNode { key: pending, .. } if pending == key)
        });
    }

    /// Number of pending jobs.
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
