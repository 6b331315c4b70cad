//! State Containers and Composition
//!
//! This module implements the mutable state cell at the bottom of the
//! engine and the hierarchy engine that composes cells into trees.
//!
//! A container holds a JSON state value and an optional reducer hierarchy.
//! A hierarchy descriptor at each position is exactly one of: null (no
//! state), a reducer function, a nested container, or a map of named
//! children. Branches fold their children into a combined reducer that
//! preserves the previous state reference when nothing changed.
//!
//! Dispatches on a root are routed to the right sub-container: delegation
//! envelopes bypass intermediate reducers, hydration pushes slices down to
//! container children, and independent child updates propagate back up
//! through parent-owned subscriptions.

mod hierarchy;
mod store;

pub use hierarchy::Hierarchy;
pub use store::{Container, Reducer, SubscriberCallback, Subscription};
