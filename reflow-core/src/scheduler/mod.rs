//! Job Scheduler
//!
//! The scheduler is an ordered queue of pending work items — re-evaluate a
//! node, notify an external subscriber, run a deferred effect — drained to
//! completion before control returns to the caller.
//!
//! # Ordering
//!
//! Jobs sort first by class (`EvaluateNode`, then `NotifyExternal`, then
//! `RunEffect`), second by priority: node weight for evaluations (heavier
//! first), edge flag score for notifications (synchronous, confirmed
//! subscribers first). Ties break FIFO. Effect jobs always run after all
//! evaluation and notification work regardless of weight.
//!
//! # Run-to-completion
//!
//! Once a flush begins it does not yield until the queue — including jobs
//! added mid-flush — is empty. There is no time-slicing; work interleaves
//! only at job boundaries. The flush loop itself lives on the ecosystem,
//! which owns the registries jobs need.
//!
//! This module also hosts the TTL timer wheel and the clock abstraction that
//! lets tests drive deadlines deterministically.

mod job;
mod queue;
mod timers;

pub use timers::{Clock, ManualClock, SystemClock};

pub(crate) use job::{Job, JobKind};
pub(crate) use queue::Scheduler;
pub(crate) use timers::Timers;
