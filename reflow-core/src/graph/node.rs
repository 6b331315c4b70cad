//! Graph Nodes and Edges
//!
//! This module defines the node and edge types that live in the dependency
//! graph. Nodes are identified by stable string keys; edges are classified
//! along two independent axes (dynamic vs. static, internal vs. external)
//! plus modifier flags affecting scheduling priority.

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

use super::ghost::GhostShim;

/// Stable identifier for a node in the dependency graph.
///
/// Keys are cheap to clone and compare; the backing string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Create a key from anything string-like.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for NodeKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// The event delivered to an external subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The node's value changed.
    Updated,
    /// The node was destroyed; no further signals will follow.
    Destroyed,
}

/// Edge classification flags.
///
/// An edge with no flags set is static and internal: it keeps the dependency
/// alive and visible in the graph but never triggers re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeFlags(u8);

impl EdgeFlags {
    /// The dependent re-evaluates when the dependency's value changes.
    pub const DYNAMIC: Self = Self(1);
    /// The dependent is an opaque callback outside the graph.
    pub const EXTERNAL: Self = Self(1 << 1);
    /// The dependent consumes the value asynchronously; deprioritized among
    /// external notifications.
    pub const ASYNC: Self = Self(1 << 2);
    /// The edge was created speculatively; notifications are buffered until
    /// it is materialized.
    pub const GHOST: Self = Self(1 << 3);

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the dependency's changes re-evaluate the dependent.
    pub fn is_dynamic(self) -> bool {
        self.contains(Self::DYNAMIC)
    }

    /// Whether the edge only keeps the dependency alive.
    pub fn is_static(self) -> bool {
        !self.is_dynamic()
    }

    /// Whether the dependent lives outside the graph.
    pub fn is_external(self) -> bool {
        self.contains(Self::EXTERNAL)
    }

    /// Whether the edge is speculative.
    pub fn is_ghost(self) -> bool {
        self.contains(Self::GHOST)
    }

    /// Tie-break score for external notification jobs. Lower runs first:
    /// synchronous, confirmed subscribers before async and ghost ones.
    pub fn flag_score(self) -> u8 {
        let mut score = 0;
        if self.contains(Self::ASYNC) {
            score += 1;
        }
        if self.contains(Self::GHOST) {
            score += 2;
        }
        score
    }
}

impl std::ops::BitOr for EdgeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EdgeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Callback invoked for an external edge.
pub type ExternalCallback = Arc<dyn Fn(Signal, &Arc<Value>) + Send + Sync>;

/// The callback slot of an external edge: either the subscriber's callback
/// directly, or a ghost shim buffering calls until materialization.
#[derive(Clone)]
pub enum EdgeCallback {
    /// Calls are forwarded to the subscriber immediately.
    Direct(ExternalCallback),
    /// Calls are routed through a ghost shim.
    Ghost(Arc<GhostShim>),
}

impl EdgeCallback {
    /// Deliver a signal through this slot.
    pub fn deliver(&self, signal: Signal, value: &Arc<Value>) {
        match self {
            Self::Direct(callback) => callback(signal, value),
            Self::Ghost(shim) => shim.deliver(signal, value),
        }
    }
}

impl fmt::Debug for EdgeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("EdgeCallback::Direct"),
            Self::Ghost(_) => f.write_str("EdgeCallback::Ghost"),
        }
    }
}

/// A directed dependency relationship, stored on the dependency's node keyed
/// by the dependent.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Classification flags.
    pub flags: EdgeFlags,
    /// Label describing the operation that created the edge.
    pub operation: String,
    /// Present iff the edge is external.
    pub callback: Option<EdgeCallback>,
}

impl Edge {
    /// An edge between two graph-owned nodes.
    pub fn internal(flags: EdgeFlags, operation: impl Into<String>) -> Self {
        Self {
            flags,
            operation: operation.into(),
            callback: None,
        }
    }

    /// An edge to a consumer outside the graph.
    pub fn external(flags: EdgeFlags, operation: impl Into<String>, callback: EdgeCallback) -> Self {
        Self {
            flags: flags | EdgeFlags::EXTERNAL,
            operation: operation.into(),
            callback: Some(callback),
        }
    }
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct GraphNode {
    /// This node's key.
    key: NodeKey,

    /// Keys of nodes this node currently reads (its dependencies).
    dependencies: IndexSet<NodeKey>,

    /// Edges from dependents, keyed by the dependent's key. External
    /// dependents appear under synthesized keys.
    dependents: IndexMap<NodeKey, Edge>,

    /// 1 + the sum of all dependents' weights. A scheduling priority signal,
    /// not a correctness mechanism.
    weight: u64,
}

impl GraphNode {
    /// Create a node with no edges and weight 1.
    pub fn new(key: NodeKey) -> Self {
        Self {
            key,
            dependencies: IndexSet::new(),
            dependents: IndexMap::new(),
            weight: 1,
        }
    }

    /// The node's key.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// The node's current weight.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub(crate) fn apply_weight_delta(&mut self, delta: i64) {
        self.weight = self.weight.saturating_add_signed(delta);
    }

    /// Keys this node depends on.
    pub fn dependencies(&self) -> &IndexSet<NodeKey> {
        &self.dependencies
    }

    /// Edges from this node's dependents.
    pub fn dependents(&self) -> &IndexMap<NodeKey, Edge> {
        &self.dependents
    }

    /// Whether anything depends on this node.
    pub fn has_dependents(&self) -> bool {
        !self.dependents.is_empty()
    }

    pub(crate) fn add_dependency(&mut self, key: NodeKey) {
        self.dependencies.insert(key);
    }

    pub(crate) fn remove_dependency(&mut self, key: &NodeKey) {
        self.dependencies.shift_remove(key);
    }

    pub(crate) fn insert_dependent(&mut self, key: NodeKey, edge: Edge) -> Option<Edge> {
        self.dependents.insert(key, edge)
    }

    pub(crate) fn remove_dependent(&mut self, key: &NodeKey) -> Option<Edge> {
        self.dependents.shift_remove(key)
    }

    pub(crate) fn dependent_mut(&mut self, key: &NodeKey) -> Option<&mut Edge> {
        self.dependents.get_mut(key)
    }
}
