//! Hierarchy Composition Engine
//!
//! Converts a declarative tree of reducers and containers into an executable
//! hierarchy. A branch node computes its own combined reducer by folding
//! over its children; a child container is driven like a reducer (actions
//! dispatch into it) and additionally propagates its independent changes
//! back up through a callback registered by the parent.
//!
//! # Ownership
//!
//! The parent owns the registration: each container child's node holds the
//! `Subscription` handle, and dropping the node (because recomposition
//! removed or replaced the child) unsubscribes. The child only ever invokes
//! an opaque callback — it holds no back-pointer to the parent.
//!
//! # Diff/merge
//!
//! Recomposing with a new descriptor merges recursively by child name: a
//! child present only in the old tree is destroyed, a child whose
//! descriptor type changed is replaced wholesale, and a container child
//! pointing at the same cell keeps its existing subscription.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::action::{Action, ActionChain, ACTION_SET_STATE, META_HYDRATE, META_INHERIT};
use crate::error::Result;

use super::store::{Container, ContainerInner, Reducer, Subscription};

/// Declarative description of a reducer hierarchy.
pub enum Hierarchy {
    /// No state at this position.
    Null,
    /// A leaf reducer function.
    Reducer(Reducer),
    /// A nested container driven by (and propagating back into) the parent.
    Container(Container),
    /// A branch of named children.
    Branch(IndexMap<String, Hierarchy>),
}

impl Hierarchy {
    /// Convenience constructor for a branch node.
    pub fn branch<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, Hierarchy)>,
        K: Into<String>,
    {
        Self::Branch(children.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// The result of running a node's reducer over its slice.
pub(crate) enum Reduced {
    /// The slice did not change; the caller keeps the previous value (and,
    /// at the root, the previous state reference).
    Unchanged,
    /// The slice changed to this value.
    Changed(Value),
}

/// Executable form of a [`Hierarchy`].
pub(crate) enum HierarchyNode {
    Null,
    Reducer(Reducer),
    Container {
        container: Container,
        /// Parent-owned registration; dropping it unsubscribes.
        _subscription: Subscription,
    },
    Branch(IndexMap<String, HierarchyNode>),
}

impl HierarchyNode {
    /// Compile a descriptor, wiring propagation callbacks for container
    /// children as they are encountered.
    pub(crate) fn compile(
        descriptor: Hierarchy,
        parent: &Arc<ContainerInner>,
        path: &[String],
    ) -> Self {
        match descriptor {
            Hierarchy::Null => Self::Null,
            Hierarchy::Reducer(reducer) => Self::Reducer(reducer),
            Hierarchy::Container(container) => {
                let subscription = wire_propagation(&container, parent, path);
                Self::Container {
                    container,
                    _subscription: subscription,
                }
            }
            Hierarchy::Branch(children) => Self::Branch(
                children
                    .into_iter()
                    .map(|(key, child)| {
                        let mut child_path = path.to_vec();
                        child_path.push(key.clone());
                        (key, Self::compile(child, parent, &child_path))
                    })
                    .collect(),
            ),
        }
    }

    /// Merge an old tree with a new descriptor.
    pub(crate) fn merge(
        previous: Self,
        descriptor: Hierarchy,
        parent: &Arc<ContainerInner>,
        path: Vec<String>,
    ) -> Self {
        match (previous, descriptor) {
            (Self::Branch(mut old_children), Hierarchy::Branch(new_children)) => {
                let merged = new_children
                    .into_iter()
                    .map(|(key, child)| {
                        let mut child_path = path.clone();
                        child_path.push(key.clone());
                        let node = match old_children.shift_remove(&key) {
                            Some(old_child) => {
                                Self::merge(old_child, child, parent, child_path)
                            }
                            None => Self::compile(child, parent, &child_path),
                        };
                        (key, node)
                    })
                    .collect();
                // Whatever is left in `old_children` was removed by the new
                // descriptor; dropping it unsubscribes container children
                // recursively.
                Self::Branch(merged)
            }
            (
                Self::Container {
                    container: old_container,
                    _subscription,
                },
                Hierarchy::Container(new_container),
            ) if old_container.ptr_eq(&new_container) => Self::Container {
                container: old_container,
                _subscription,
            },
            (_, descriptor) => Self::compile(descriptor, parent, &path),
        }
    }

    /// Run the hierarchy over the previous state slice.
    pub(crate) fn reduce(&self, previous: Option<&Value>, chain: &ActionChain) -> Result<Reduced> {
        match self {
            Self::Null => Ok(Reduced::Unchanged),
            Self::Reducer(reducer) => {
                let next = reducer(previous, chain.action());
                if previous == Some(&next) {
                    Ok(Reduced::Unchanged)
                } else {
                    Ok(Reduced::Changed(next))
                }
            }
            Self::Container { container, .. } => {
                let next = container.dispatch(chain.clone())?;
                if previous == Some(next.as_ref()) {
                    Ok(Reduced::Unchanged)
                } else {
                    Ok(Reduced::Changed(next.as_ref().clone()))
                }
            }
            Self::Branch(children) => {
                let previous_map = previous.and_then(Value::as_object);
                // Unknown keys (e.g. hydrated state outside the hierarchy)
                // survive recomposition untouched.
                let mut next: Map<String, Value> = previous_map.cloned().unwrap_or_default();
                let mut changed = false;

                for (key, child) in children {
                    let slice = previous_map.and_then(|m| m.get(key));
                    match child.reduce(slice, chain)? {
                        Reduced::Unchanged => {}
                        Reduced::Changed(value) => {
                            changed = true;
                            next.insert(key.clone(), value);
                        }
                    }
                }

                if changed {
                    Ok(Reduced::Changed(Value::Object(next)))
                } else {
                    Ok(Reduced::Unchanged)
                }
            }
        }
    }

    /// Resolve a delegation path to the container it targets. Returns the
    /// container and any path remainder to be re-delegated inside it.
    pub(crate) fn route(&self, path: &[String]) -> Option<(Container, Vec<String>)> {
        match self {
            Self::Container { container, .. } => Some((container.clone(), path.to_vec())),
            Self::Branch(children) => {
                let (head, rest) = path.split_first()?;
                children.get(head)?.route(rest)
            }
            _ => None,
        }
    }

    /// Push slices of a hydrated parent state down into container children,
    /// marked with the inherit envelope.
    pub(crate) fn push_inherited(&self, state: &Value) -> Result<()> {
        match self {
            Self::Container { container, .. } => {
                let chain = ActionChain::from(Action::new(ACTION_SET_STATE, state.clone()))
                    .wrap(META_HYDRATE, Value::Null)
                    .wrap(META_INHERIT, Value::Null);
                container.dispatch(chain)?;
                Ok(())
            }
            Self::Branch(children) => {
                for (key, child) in children {
                    if let Some(slice) = state.get(key) {
                        child.push_inherited(slice)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn wire_propagation(
    child: &Container,
    parent: &Arc<ContainerInner>,
    path: &[String],
) -> Subscription {
    let weak_parent = Arc::downgrade(parent);
    let child_path: Vec<String> = path.to_vec();

    child.subscribe(move |chain, new, _old| {
        let Some(parent) = weak_parent.upgrade() else {
            return;
        };
        // A parent mid-dispatch caused this child update itself; propagating
        // it back up would double-notify.
        if parent.dispatching.load(Ordering::SeqCst) {
            return;
        }
        Container { inner: parent }.apply_child_propagation(&child_path, chain, new);
    })
}
