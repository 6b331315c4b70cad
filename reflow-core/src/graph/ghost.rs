//! Ghost Edges
//!
//! A ghost edge supports consumers whose subscription intent is not yet
//! confirmed — e.g. a speculative render that may be discarded before it
//! commits. The edge's callback is replaced with a buffering shim that
//! records the latest call without forwarding it.
//!
//! A ghost moves through three states:
//!
//! 1. `Transparent` (default): calls are recorded, not forwarded. Only the
//!    most recent call is kept.
//! 2. `Materialized`: the consumer confirmed. The buffered call (if any) is
//!    replayed exactly once, and subsequent calls forward directly.
//! 3. `Destroyed`: the consumer bailed. The buffer is dropped and no further
//!    call has any effect.
//!
//! Materializing an already-destroyed ghost is a logged no-op, since the
//! producer may have legitimately raced ahead.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use super::node::{ExternalCallback, Signal};

#[derive(Debug)]
enum GhostState {
    Transparent {
        buffered: Option<(Signal, Arc<Value>)>,
    },
    Materialized,
    Destroyed,
}

/// Buffering shim standing in for an external edge's callback while the
/// subscription is speculative.
pub struct GhostShim {
    state: Mutex<GhostState>,
    inner: ExternalCallback,
}

impl GhostShim {
    /// Wrap a subscriber callback in a transparent ghost.
    pub fn new(inner: ExternalCallback) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GhostState::Transparent { buffered: None }),
            inner,
        })
    }

    /// Deliver a signal through the shim: buffered while transparent,
    /// forwarded once materialized, dropped once destroyed.
    pub fn deliver(&self, signal: Signal, value: &Arc<Value>) {
        let mut state = self.state.lock();
        match &mut *state {
            GhostState::Transparent { buffered } => {
                *buffered = Some((signal, Arc::clone(value)));
            }
            GhostState::Materialized => {
                drop(state);
                (self.inner)(signal, value);
            }
            GhostState::Destroyed => {}
        }
    }

    /// Confirm the subscription: replay the latest buffered call (if any)
    /// exactly once and forward everything from here on.
    pub fn materialize(&self) {
        let replay = {
            let mut state = self.state.lock();
            match &mut *state {
                GhostState::Transparent { buffered } => {
                    let replay = buffered.take();
                    *state = GhostState::Materialized;
                    replay
                }
                GhostState::Materialized => None,
                GhostState::Destroyed => {
                    warn!("materialize called on a destroyed ghost edge; ignoring");
                    None
                }
            }
        };

        if let Some((signal, value)) = replay {
            (self.inner)(signal, &value);
        }
    }

    /// Discard the subscription. The buffer is dropped; later deliveries and
    /// materialization attempts have no effect.
    pub fn destroy(&self) {
        *self.state.lock() = GhostState::Destroyed;
    }

    /// Whether the ghost has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(*self.state.lock(), GhostState::Destroyed)
    }

    /// Whether the ghost has been materialized.
    pub fn is_materialized(&self) -> bool {
        matches!(*self.state.lock(), GhostState::Materialized)
    }
}

impl std::fmt::Debug for GhostShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GhostShim")
            .field("state", &*self.state.lock())
            .finish()
    }
}
