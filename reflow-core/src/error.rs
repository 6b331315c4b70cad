//! Error Types
//!
//! The error taxonomy distinguishes misuse (raised immediately, fatal to the
//! operation), routing failures (a delegation path that resolves to nothing),
//! evaluation failures (an error returned by a factory or selector function),
//! and forwarded async failures (a rejected promise surfaced on read).
//!
//! Graph-internal inconsistencies are deliberately *not* errors: lookups on
//! unknown keys degrade to no-ops, with debug assertions and log warnings
//! guarding development builds.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by the runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// `dispatch` was re-entered while the container was already mid-dispatch.
    #[error("container `{id}` is already dispatching")]
    DispatchWhileDispatching {
        /// The offending container's id.
        id: String,
    },

    /// A state mutator (`set_state`, `set_state_deep`) was called from inside
    /// a reducer of the same container.
    #[error("cannot mutate container `{id}` while it is dispatching")]
    MutateWhileDispatching {
        /// The offending container's id.
        id: String,
    },

    /// An action or meta chain did not have the expected shape.
    #[error("malformed action: {detail}")]
    MalformedAction {
        /// What was wrong with it.
        detail: String,
    },

    /// A delegation path did not resolve to a container node.
    #[error("delegation path `{path}` does not resolve to a container")]
    BadDelegationPath {
        /// The path as it was given, joined with `.`.
        path: String,
    },

    /// An instance's factory returned a different backing kind (or a
    /// different container) than its first evaluation established.
    #[error("instance `{id}` changed its backing kind between evaluations")]
    BackingKindChanged {
        /// The offending instance's id.
        id: String,
    },

    /// A factory or selector function failed. Injector cleanups registered by
    /// the partial evaluation have already run by the time this surfaces.
    #[error("evaluation of `{id}` failed: {message}")]
    Evaluation {
        /// The node whose evaluation failed.
        id: String,
        /// The underlying failure, stringified.
        message: String,
    },

    /// A promise forwarded by an instance was rejected. Recorded as the
    /// instance's error state and surfaced on read, never thrown during
    /// propagation.
    #[error("promise forwarded by `{id}` was rejected: {message}")]
    PromiseRejected {
        /// The owning instance's id.
        id: String,
        /// The rejection reason.
        message: String,
    },

    /// Snapshot encoding or decoding failed.
    #[error("snapshot serialization failed: {0}")]
    Snapshot(String),
}

impl Error {
    /// Wrap an arbitrary failure as an evaluation error for the given node.
    pub fn evaluation(id: impl Into<String>, source: impl std::fmt::Display) -> Self {
        Self::Evaluation {
            id: id.into(),
            message: source.to_string(),
        }
    }
}
