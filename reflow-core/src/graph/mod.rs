//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between computation nodes and determines what must re-run when a value
//! changes.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent addressable state cells: atom instances, derived-value
//!   cache items, and (as pseudo-nodes) external subscribers
//! - Edges represent dependencies: if A reads B, B records an edge to A
//!
//! Edges are classified along two independent axes. Dynamic edges trigger
//! re-evaluation of the dependent when the dependency changes; static edges
//! only keep the dependency alive and visible. Internal edges connect two
//! graph-owned nodes; external edges connect a node to an opaque callback
//! owned by a consumer outside the graph.
//!
//! # Design Decisions
//!
//! 1. We use a centralized node table rather than distributed linked lists
//!    because it keeps weight propagation and inspection views simple and
//!    allows one lock to guard all structural mutation.
//!
//! 2. The table is indexed by stable string key for O(1) lookups.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents)
//!    edges to enable efficient traversal in both directions.

mod ghost;
#[allow(clippy::module_inception)]
mod graph;
mod node;

pub use ghost::GhostShim;
pub use graph::{Graph, NodeView, TreeView};
pub use node::{Edge, EdgeCallback, EdgeFlags, ExternalCallback, GraphNode, NodeKey, Signal};

pub(crate) use graph::DependentJob;
