//! State Containers
//!
//! A Container is a named mutable cell holding a JSON state value plus an
//! optional reducer hierarchy. Containers support dispatch, direct set,
//! deep-merge set, and subscription, and can be composed into trees where a
//! branch delegates to child containers.
//!
//! # How Updates Work
//!
//! 1. `dispatch` runs the reducer hierarchy against the current state and
//!    swaps in the result. Subscribers are notified exactly once, after the
//!    swap — a subscriber never observes a container mid-update.
//!
//! 2. `set_state` / `set_state_deep` are dispatches of an administrative
//!    action wrapped in a hydrate meta envelope, so observers can tell them
//!    apart from reducer-driven updates.
//!
//! 3. An action wrapped in a `delegate` envelope is routed directly to the
//!    container at the carried path, bypassing this container's reducer.
//!
//! State lives behind `Arc`, so an update that changes nothing preserves
//! pointer identity — consumers relying on reference equality skip work.
//!
//! # Reentrancy
//!
//! A `dispatching` flag guards against re-entrant dispatch and against state
//! mutators called from inside a reducer; both are programmer-misuse errors,
//! raised immediately. The same flag suppresses upward re-propagation of
//! child updates that this container itself caused.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::trace;

use crate::action::{
    Action, ActionChain, ACTION_INIT, ACTION_SET_STATE, META_DELEGATE, META_HYDRATE,
    META_PARTIAL_HYDRATE,
};
use crate::error::{Error, Result};

use super::hierarchy::{Hierarchy, HierarchyNode, Reduced};

/// A pure state transition: `(previous state, action) -> next state`.
/// `None` means the slice has not been initialized yet.
pub type Reducer = Arc<dyn Fn(Option<&Value>, &Action) -> Value + Send + Sync>;

/// Callback invoked after a state change with `(action, new, old)`.
pub type SubscriberCallback = Arc<dyn Fn(&ActionChain, &Arc<Value>, &Arc<Value>) + Send + Sync>;

pub(crate) struct ContainerInner {
    id: String,
    state: RwLock<Arc<Value>>,
    tree: RwLock<HierarchyNode>,
    subscribers: RwLock<Vec<(u64, SubscriberCallback)>>,
    next_subscriber_id: AtomicU64,
    pub(crate) dispatching: AtomicBool,
}

/// A named mutable state cell. Cloning the handle shares the cell.
#[derive(Clone)]
pub struct Container {
    pub(crate) inner: Arc<ContainerInner>,
}

/// Handle to a registered subscriber. Unsubscribes on drop.
pub struct Subscription {
    container: Weak<ContainerInner>,
    id: u64,
}

impl Subscription {
    /// Remove the subscriber now instead of waiting for drop.
    pub fn unsubscribe(&self) {
        if let Some(container) = self.container.upgrade() {
            container
                .subscribers
                .write()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Clears the dispatching flag when a dispatch unwinds.
struct DispatchGuard<'a> {
    inner: &'a ContainerInner,
}

impl<'a> DispatchGuard<'a> {
    fn enter(inner: &'a ContainerInner) -> Result<Self> {
        if inner.dispatching.swap(true, Ordering::SeqCst) {
            return Err(Error::DispatchWhileDispatching {
                id: inner.id.clone(),
            });
        }
        Ok(Self { inner })
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.inner.dispatching.store(false, Ordering::SeqCst);
    }
}

impl Container {
    /// Create a container with no reducer and a `null` state.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                id: id.into(),
                state: RwLock::new(Arc::new(Value::Null)),
                tree: RwLock::new(HierarchyNode::Null),
                subscribers: RwLock::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(0),
                dispatching: AtomicBool::new(false),
            }),
        }
    }

    /// Create a container driven by a single root reducer.
    pub fn with_reducer(id: impl Into<String>, reducer: Reducer) -> Result<Self> {
        Self::with_hierarchy(id, Hierarchy::Reducer(reducer))
    }

    /// Create a container from a hierarchy descriptor.
    pub fn with_hierarchy(id: impl Into<String>, descriptor: Hierarchy) -> Result<Self> {
        let container = Self::new(id);
        container.use_hierarchy(descriptor)?;
        Ok(container)
    }

    /// The container's id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The current state.
    pub fn get_state(&self) -> Arc<Value> {
        Arc::clone(&self.inner.state.read())
    }

    /// Whether two handles share the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// (Re)compose the reducer hierarchy, diffing against the previous one,
    /// then recompute the state through the new tree.
    ///
    /// Children present in the old tree but absent from the new descriptor
    /// are recursively destroyed (container children unsubscribed); a child
    /// whose descriptor type changed is replaced wholesale.
    pub fn use_hierarchy(&self, descriptor: Hierarchy) -> Result<()> {
        if self.inner.dispatching.load(Ordering::SeqCst) {
            return Err(Error::MutateWhileDispatching {
                id: self.inner.id.clone(),
            });
        }

        {
            let mut tree = self.inner.tree.write();
            let previous = std::mem::replace(&mut *tree, HierarchyNode::Null);
            *tree = HierarchyNode::merge(previous, descriptor, &self.inner, Vec::new());
        }

        self.dispatch(Action::new(ACTION_INIT, Value::Null))?;
        Ok(())
    }

    /// Dispatch an action (or meta chain) through the reducer hierarchy.
    ///
    /// Returns the state after the dispatch. Raises
    /// [`Error::DispatchWhileDispatching`] on re-entry.
    pub fn dispatch(&self, chain: impl Into<ActionChain>) -> Result<Arc<Value>> {
        let chain = chain.into();

        // Delegation routes to a nested container before this container's
        // own dispatch machinery engages.
        if let Some(data) = chain.meta_data(META_DELEGATE).cloned() {
            return self.delegate(&data, chain);
        }

        let guard = DispatchGuard::enter(&self.inner)?;
        let old = self.get_state();

        let new = if chain.has_meta(META_HYDRATE) {
            let next = Arc::new(chain.action().payload.clone());
            self.push_down(&next)?;
            next
        } else if chain.has_meta(META_PARTIAL_HYDRATE) {
            let next = Arc::new(deep_merge(old.as_ref(), &chain.action().payload));
            self.push_down(&next)?;
            next
        } else {
            let tree = self.inner.tree.read();
            let previous = (!old.is_null()).then_some(old.as_ref());
            match tree.reduce(previous, &chain)? {
                Reduced::Unchanged => Arc::clone(&old),
                Reduced::Changed(value) => Arc::new(value),
            }
        };

        *self.inner.state.write() = Arc::clone(&new);
        drop(guard);

        if !Arc::ptr_eq(&new, &old) && *new != *old {
            trace!(container = %self.inner.id, action = %chain.action().kind, "state changed");
            self.notify(&chain, &new, &old);
        }

        Ok(new)
    }

    /// Replace the whole state. Dispatches a hydrate-wrapped administrative
    /// action; container children receive their slices of the new state.
    pub fn set_state(&self, value: Value) -> Result<Arc<Value>> {
        self.mutator_chain(META_HYDRATE, value)
    }

    /// Deep-merge a partial state: objects merge recursively, everything
    /// else is replaced wholesale.
    pub fn set_state_deep(&self, partial: Value) -> Result<Arc<Value>> {
        self.mutator_chain(META_PARTIAL_HYDRATE, partial)
    }

    fn mutator_chain(&self, meta_type: &str, payload: Value) -> Result<Arc<Value>> {
        if self.inner.dispatching.load(Ordering::SeqCst) {
            return Err(Error::MutateWhileDispatching {
                id: self.inner.id.clone(),
            });
        }
        self.dispatch(
            ActionChain::from(Action::new(ACTION_SET_STATE, payload)).wrap(meta_type, Value::Null),
        )
    }

    /// Register a subscriber. The callback receives the action chain and the
    /// new and old state after every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ActionChain, &Arc<Value>, &Arc<Value>) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .push((id, Arc::new(callback)));
        Subscription {
            container: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    fn delegate(&self, data: &Value, chain: ActionChain) -> Result<Arc<Value>> {
        let path = parse_path(data)?;
        let (target, remainder) = {
            let tree = self.inner.tree.read();
            tree.route(&path)
        }
        .ok_or_else(|| Error::BadDelegationPath {
            path: path.join("."),
        })?;

        let mut inner = chain.remove_meta(META_DELEGATE);
        if !remainder.is_empty() {
            // The path continues inside the child's own hierarchy.
            inner = inner.wrap(
                META_DELEGATE,
                Value::Array(remainder.into_iter().map(Value::String).collect()),
            );
        }
        target.dispatch(inner)?;

        // The child's change already propagated back up through the
        // registered propagation callback.
        Ok(self.get_state())
    }

    /// Push the slices of a hydrated state down to container children, so
    /// they stay in sync with the parent. Their upward propagation is
    /// suppressed by the dispatching flag held by the caller.
    fn push_down(&self, next: &Arc<Value>) -> Result<()> {
        let tree = self.inner.tree.read();
        tree.push_inherited(next.as_ref())
    }

    /// Incorporate an independent child container update: structurally
    /// replace the value at the child's path (copying only the nodes along
    /// it) and re-notify under a delegate envelope so observers can tell
    /// propagated updates from locally dispatched ones.
    pub(crate) fn apply_child_propagation(
        &self,
        path: &[String],
        chain: &ActionChain,
        new_child_state: &Arc<Value>,
    ) {
        let Ok(guard) = DispatchGuard::enter(&self.inner) else {
            return;
        };

        let old = self.get_state();
        let new = Arc::new(set_at_path(
            old.as_ref(),
            path,
            new_child_state.as_ref().clone(),
        ));
        *self.inner.state.write() = Arc::clone(&new);
        drop(guard);

        if *new != *old {
            let wrapped = chain.clone().wrap(
                META_DELEGATE,
                Value::Array(path.iter().map(|s| Value::String(s.clone())).collect()),
            );
            self.notify(&wrapped, &new, &old);
        }
    }

    fn notify(&self, chain: &ActionChain, new: &Arc<Value>, old: &Arc<Value>) {
        // Snapshot the subscriber list so callbacks can (un)subscribe freely.
        let subscribers: Vec<SubscriberCallback> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in subscribers {
            callback(chain, new, old);
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("state", &*self.get_state())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

fn parse_path(data: &Value) -> Result<Vec<String>> {
    let Some(parts) = data.as_array() else {
        return Err(Error::MalformedAction {
            detail: format!("delegate meta data must be an array of keys, got {data}"),
        });
    };

    parts
        .iter()
        .map(|part| {
            part.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::MalformedAction {
                    detail: format!("delegate path segment must be a string, got {part}"),
                })
        })
        .collect()
}

/// Recursive object merge: objects merge key by key, anything else in the
/// patch replaces the base wholesale.
pub(crate) fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, patch_value) in patch_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => patch_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, replacement) => replacement.clone(),
    }
}

/// Replace the value at `path`, copying only the objects along the path.
pub(crate) fn set_at_path(root: &Value, path: &[String], value: Value) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return value;
    };

    let mut map = match root {
        Value::Object(existing) => existing.clone(),
        _ => Map::new(),
    };
    let child = map.get(head).cloned().unwrap_or(Value::Null);
    let replaced = set_at_path(&child, rest, value);
    map.insert(head.clone(), replaced);
    Value::Object(map)
}
