//! Actions and the Meta-Action Envelope
//!
//! Containers are driven by actions: a kind string plus a JSON payload.
//! Administrative concerns — full hydration, partial hydration, delegation to
//! a nested container, inheritance marking — are expressed by wrapping a
//! regular action in meta envelope nodes that can be nested arbitrarily deep.
//!
//! Envelope nodes share their inner chain via `Arc`, so editing a chain
//! (adding or removing one envelope) copies only the nodes on the path to the
//! edit; everything below the edited node stays shared.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Meta type marking a full state replacement.
pub const META_HYDRATE: &str = "hydrate";

/// Meta type marking a deep-merge state update.
pub const META_PARTIAL_HYDRATE: &str = "partial-hydrate";

/// Meta type routing an action to a nested container. The meta data is the
/// path to the target: an array of child keys.
pub const META_DELEGATE: &str = "delegate";

/// Meta type marking an update pushed down from a parent container.
pub const META_INHERIT: &str = "inherit";

/// Action kind dispatched when a container (re)composes its hierarchy.
pub const ACTION_INIT: &str = "@@reflow/init";

/// Action kind carried by `set_state` / `set_state_deep` dispatches.
pub const ACTION_SET_STATE: &str = "@@reflow/set-state";

/// A plain action: a kind string plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// What happened.
    pub kind: String,
    /// Data describing it.
    pub payload: Value,
}

impl Action {
    /// Create a new action.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// An action optionally wrapped in meta envelope nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionChain {
    /// A meta envelope wrapping an inner chain.
    Wrapped {
        /// The administrative concern this envelope marks.
        meta_type: String,
        /// Data attached to the envelope (e.g. a delegation path).
        meta_data: Value,
        /// The wrapped chain, shared structurally.
        inner: Arc<ActionChain>,
    },
    /// The innermost, unwrapped action.
    Action(Action),
}

impl From<Action> for ActionChain {
    fn from(action: Action) -> Self {
        Self::Action(action)
    }
}

impl ActionChain {
    /// The innermost action, with every envelope stripped.
    pub fn action(&self) -> &Action {
        let mut chain = self;
        loop {
            match chain {
                Self::Wrapped { inner, .. } => chain = inner,
                Self::Action(action) => return action,
            }
        }
    }

    /// Whether any envelope node in the chain carries the given meta type.
    pub fn has_meta(&self, meta_type: &str) -> bool {
        self.meta_data(meta_type).is_some()
    }

    /// The meta data of the first (outermost) envelope with the given type.
    pub fn meta_data(&self, meta_type: &str) -> Option<&Value> {
        let mut chain = self;
        loop {
            match chain {
                Self::Wrapped {
                    meta_type: t,
                    meta_data,
                    inner,
                } => {
                    if t == meta_type {
                        return Some(meta_data);
                    }
                    chain = inner;
                }
                Self::Action(_) => return None,
            }
        }
    }

    /// Wrap this chain in a new outermost envelope.
    pub fn wrap(self, meta_type: impl Into<String>, meta_data: Value) -> Self {
        Self::Wrapped {
            meta_type: meta_type.into(),
            meta_data,
            inner: Arc::new(self),
        }
    }

    /// Remove the first (outermost) envelope with the given meta type.
    ///
    /// Only the nodes above the removed envelope are copied; the rest of the
    /// chain is shared with the original. Returns a clone of the original
    /// chain when no envelope matches.
    pub fn remove_meta(&self, meta_type: &str) -> Self {
        match self {
            Self::Wrapped {
                meta_type: t,
                meta_data,
                inner,
            } => {
                if t == meta_type {
                    inner.as_ref().clone()
                } else {
                    Self::Wrapped {
                        meta_type: t.clone(),
                        meta_data: meta_data.clone(),
                        inner: Arc::new(inner.remove_meta(meta_type)),
                    }
                }
            }
            Self::Action(action) => Self::Action(action.clone()),
        }
    }

    /// The number of envelope nodes above the innermost action.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut chain = self;
        while let Self::Wrapped { inner, .. } = chain {
            depth += 1;
            chain = inner;
        }
        depth
    }
}
