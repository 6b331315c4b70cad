//! The Dependency Graph
//!
//! The graph tracks every node's dependencies and dependents and maintains
//! node weights. Weight is a scheduling priority signal: a node's weight is
//! 1 plus the sum of its dependents' weights (external dependents count as
//! 1), so widely-depended-upon nodes sort ahead of narrow ones and settle
//! before their consumers run.
//!
//! Weight changes propagate transitively: when an edge is added or removed,
//! the dependency's weight changes, which changes the weight of everything
//! the dependency itself reads, and so on down to the root producers. The
//! propagation is path-counting on purpose — a dependent reachable along two
//! paths contributes twice, keeping the local invariant
//! `weight == 1 + sum(dependent weights)` true at every node.
//!
//! Operations on unknown keys are tolerated silently in release builds; the
//! graph is expected to be internally consistent by construction, so these
//! only fire on wiring bugs and are guarded by debug assertions.

use std::collections::HashSet;

use indexmap::IndexMap;
use tracing::warn;

use super::node::{Edge, EdgeFlags, GraphNode, NodeKey};

/// Work item produced when a node's value changes, classified per edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DependentJob {
    /// Re-evaluate an internal dependent; priority is its node weight.
    Evaluate { key: NodeKey, weight: u64 },
    /// Notify an external dependent; priority is the edge's flag score.
    Notify {
        dependency: NodeKey,
        dependent: NodeKey,
        flag_score: u8,
    },
}

/// Flat inspection view of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    /// The node's key.
    pub key: NodeKey,
    /// The node's weight.
    pub weight: u64,
    /// Keys the node reads.
    pub dependencies: Vec<NodeKey>,
    /// Keys that read the node (external dependents included).
    pub dependents: Vec<NodeKey>,
}

/// Recursive inspection view rooted at a producer or consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeView {
    /// The node at this position.
    pub key: NodeKey,
    /// The node's weight (1 for external pseudo-nodes).
    pub weight: u64,
    /// Children per the traversal direction.
    pub children: Vec<TreeView>,
}

/// The dependency-tracking core.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: IndexMap<NodeKey, GraphNode>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no edges and weight 1. Idempotent.
    pub fn add_node(&mut self, key: NodeKey) {
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| GraphNode::new(key));
    }

    /// Whether a node exists.
    pub fn has_node(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Look up a node.
    pub fn node(&self, key: &NodeKey) -> Option<&GraphNode> {
        self.nodes.get(key)
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// A node's weight; external pseudo-keys and unknown keys count as 1.
    pub fn weight_of(&self, key: &NodeKey) -> u64 {
        self.nodes.get(key).map_or(1, GraphNode::weight)
    }

    /// Record that `dependent` reads `dependency`.
    ///
    /// Updates both sides, propagates the weight increase through the
    /// dependency's own dependency chain, and returns `true` when the
    /// dependency previously had no dependents — the owner uses this to
    /// cancel a pending destruction.
    pub fn add_edge(&mut self, dependent: &NodeKey, dependency: &NodeKey, edge: Edge) -> bool {
        // Replacing an existing edge must not double-count its weight.
        if self
            .nodes
            .get(dependency)
            .is_some_and(|n| n.dependents().contains_key(dependent))
        {
            self.remove_edge(dependent, dependency);
        }

        let is_external = edge.flags.is_external();
        let delta = if is_external {
            1
        } else {
            self.weight_of(dependent) as i64
        };

        let Some(node) = self.nodes.get_mut(dependency) else {
            debug_assert!(false, "add_edge on unknown dependency {dependency}");
            warn!(%dependency, "add_edge on unknown dependency; ignoring");
            return false;
        };

        let revived = !node.has_dependents();
        node.insert_dependent(dependent.clone(), edge);

        if !is_external {
            if let Some(dependent_node) = self.nodes.get_mut(dependent) {
                dependent_node.add_dependency(dependency.clone());
            } else {
                debug_assert!(false, "add_edge on unknown dependent {dependent}");
            }
        }

        self.propagate_weight(dependency, delta);
        revived
    }

    /// Remove the edge from `dependent` to `dependency`.
    ///
    /// Returns `true` when the dependency's dependents set became empty; the
    /// owner then schedules destruction (never destroys synchronously from
    /// here — destruction is itself schedulable, to allow a grace period).
    pub fn remove_edge(&mut self, dependent: &NodeKey, dependency: &NodeKey) -> bool {
        let dependent_weight = self.weight_of(dependent) as i64;

        let Some(node) = self.nodes.get_mut(dependency) else {
            return false;
        };
        let Some(edge) = node.remove_dependent(dependent) else {
            return false;
        };

        let orphaned = !node.has_dependents();
        let delta = if edge.flags.is_external() {
            1
        } else {
            dependent_weight
        };

        if !edge.flags.is_external() {
            if let Some(dependent_node) = self.nodes.get_mut(dependent) {
                dependent_node.remove_dependency(dependency);
            }
        }

        self.propagate_weight(dependency, -delta);
        orphaned
    }

    /// Update the flags of an existing internal edge in place (used for
    /// static-to-dynamic upgrades; weight is unaffected).
    pub fn set_edge_flags(&mut self, dependent: &NodeKey, dependency: &NodeKey, flags: EdgeFlags) {
        if let Some(edge) = self
            .nodes
            .get_mut(dependency)
            .and_then(|n| n.dependent_mut(dependent))
        {
            edge.flags = flags;
        }
    }

    /// Detach a node from all neighbors and delete it.
    ///
    /// Returns the keys of dependencies that became orphaned, so the owner
    /// can schedule their destruction.
    pub fn remove_node(&mut self, key: &NodeKey) -> Vec<NodeKey> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };

        let dependencies: Vec<NodeKey> = node.dependencies().iter().cloned().collect();
        let dependents: Vec<NodeKey> = node
            .dependents()
            .iter()
            .filter(|(_, e)| !e.flags.is_external())
            .map(|(k, _)| k.clone())
            .collect();

        let mut orphaned = Vec::new();
        for dependency in &dependencies {
            if self.remove_edge(key, dependency) {
                orphaned.push(dependency.clone());
            }
        }

        for dependent in &dependents {
            if let Some(dependent_node) = self.nodes.get_mut(dependent) {
                dependent_node.remove_dependency(key);
            }
        }

        self.nodes.shift_remove(key);
        orphaned
    }

    /// Compute the work caused by a value change on `key`: one job per
    /// dynamic dependent edge. Static edges are skipped entirely — they
    /// never cause re-evaluation.
    pub(crate) fn schedule_dependents(&self, key: &NodeKey) -> Vec<DependentJob> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };

        node.dependents()
            .iter()
            .filter(|(_, edge)| edge.flags.is_dynamic())
            .map(|(dependent, edge)| {
                if edge.flags.is_external() {
                    DependentJob::Notify {
                        dependency: key.clone(),
                        dependent: dependent.clone(),
                        flag_score: edge.flags.flag_score(),
                    }
                } else {
                    DependentJob::Evaluate {
                        key: dependent.clone(),
                        weight: self.weight_of(dependent),
                    }
                }
            })
            .collect()
    }

    /// Look up the callback edge for an external dependent, if it still
    /// exists by the time its notification job runs.
    pub(crate) fn external_edge(&self, dependency: &NodeKey, dependent: &NodeKey) -> Option<&Edge> {
        self.nodes
            .get(dependency)
            .and_then(|n| n.dependents().get(dependent))
            .filter(|e| e.flags.is_external())
    }

    fn propagate_weight(&mut self, start: &NodeKey, delta: i64) {
        if delta == 0 {
            return;
        }

        let mut stack = vec![start.clone()];
        while let Some(key) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(&key) {
                node.apply_weight_delta(delta);
                stack.extend(node.dependencies().iter().cloned());
            }
        }
    }

    /// Flat inspection view: every node with its direct neighbors and
    /// weight, sorted by key.
    pub fn flat_view(&self) -> Vec<NodeView> {
        let mut views: Vec<NodeView> = self
            .nodes
            .values()
            .map(|node| NodeView {
                key: node.key().clone(),
                weight: node.weight(),
                dependencies: node.dependencies().iter().cloned().collect(),
                dependents: node.dependents().keys().cloned().collect(),
            })
            .collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }

    /// Recursive view from root producers (nodes with no dependencies) down
    /// through their dependents.
    pub fn top_down_view(&self) -> Vec<TreeView> {
        self.nodes
            .values()
            .filter(|n| n.dependencies().is_empty())
            .map(|n| self.descend_dependents(n.key(), &mut HashSet::new()))
            .collect()
    }

    /// Recursive view from leaf consumers (nodes with no dependents) up
    /// through their dependencies.
    pub fn bottom_up_view(&self) -> Vec<TreeView> {
        self.nodes
            .values()
            .filter(|n| !n.has_dependents())
            .map(|n| self.descend_dependencies(n.key(), &mut HashSet::new()))
            .collect()
    }

    fn descend_dependents(&self, key: &NodeKey, seen: &mut HashSet<NodeKey>) -> TreeView {
        let children = if seen.insert(key.clone()) {
            self.nodes
                .get(key)
                .map(|node| {
                    node.dependents()
                        .keys()
                        .map(|k| self.descend_dependents(k, seen))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        seen.remove(key);

        TreeView {
            key: key.clone(),
            weight: self.weight_of(key),
            children,
        }
    }

    fn descend_dependencies(&self, key: &NodeKey, seen: &mut HashSet<NodeKey>) -> TreeView {
        let children = if seen.insert(key.clone()) {
            self.nodes
                .get(key)
                .map(|node| {
                    node.dependencies()
                        .iter()
                        .map(|k| self.descend_dependencies(k, seen))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        seen.remove(key);

        TreeView {
            key: key.clone(),
            weight: self.weight_of(key),
            children,
        }
    }
}
