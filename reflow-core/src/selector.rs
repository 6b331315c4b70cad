//! Derived-Value Cache
//!
//! Selectors are memoized pure computations layered on the same graph and
//! scheduler machinery as atom instances. A selector bound to an argument
//! tuple produces a cache item owning a graph node; reads it performs while
//! computing register dynamic edges, so it recomputes when any dependency
//! changes.
//!
//! A result-equality comparator (defaulting to value equality) guards
//! downstream propagation: when a recomputation produces an equal result,
//! the cached value keeps its identity and dependents are not scheduled.
//!
//! Cache items are destroyed as soon as their last dependent detaches —
//! a pure computation has nothing worth keeping alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::Result;
use crate::graph::{EdgeFlags, NodeKey};
use crate::instance::EvalContext;

/// The computation backing a selector.
pub type SelectorFn = Arc<dyn Fn(&mut EvalContext<'_>, &[Value]) -> Result<Value> + Send + Sync>;

/// Result-equality comparator; returning `true` suppresses downstream
/// propagation.
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

struct SelectorInner {
    key: String,
    compute: SelectorFn,
    comparator: Comparator,
}

/// A memoized derived computation.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<SelectorInner>,
}

impl Selector {
    /// Create a selector comparing results with value equality.
    pub fn new<F>(key: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&mut EvalContext<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::with_comparator(key, compute, |a, b| a == b)
    }

    /// Create a selector with a custom result-equality comparator.
    pub fn with_comparator<F, C>(key: impl Into<String>, compute: F, comparator: C) -> Self
    where
        F: Fn(&mut EvalContext<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
        C: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SelectorInner {
                key: key.into(),
                compute: Arc::new(compute),
                comparator: Arc::new(comparator),
            }),
        }
    }

    /// The selector's key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub(crate) fn compute(&self) -> &SelectorFn {
        &self.inner.compute
    }

    pub(crate) fn comparator(&self) -> &Comparator {
        &self.inner.comparator
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("key", &self.inner.key)
            .finish()
    }
}

/// A selector bound to an argument tuple, holding its last result and its
/// graph node. Lives in the ecosystem registry like an instance, minus the
/// side-effecting parts: no injectors, no container, no TTL grace period.
pub(crate) struct SelectorItem {
    id: NodeKey,
    selector: Selector,
    args: Vec<Value>,
    param_token: Option<u64>,
    value: RwLock<Arc<Value>>,
    pub(crate) tracked: Mutex<IndexMap<NodeKey, EdgeFlags>>,
    eval_pending: AtomicBool,
    destroyed: AtomicBool,
}

impl SelectorItem {
    pub(crate) fn new(
        id: NodeKey,
        selector: Selector,
        args: Vec<Value>,
        param_token: Option<u64>,
    ) -> Self {
        Self {
            id,
            selector,
            args,
            param_token,
            value: RwLock::new(Arc::new(Value::Null)),
            tracked: Mutex::new(IndexMap::new()),
            eval_pending: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> &NodeKey {
        &self.id
    }

    pub(crate) fn selector(&self) -> &Selector {
        &self.selector
    }

    pub(crate) fn args(&self) -> &[Value] {
        &self.args
    }

    pub(crate) fn param_token(&self) -> Option<u64> {
        self.param_token
    }

    pub(crate) fn value(&self) -> Arc<Value> {
        Arc::clone(&self.value.read())
    }

    pub(crate) fn set_value(&self, value: Arc<Value>) {
        *self.value.write() = value;
    }

    /// Request a recomputation job. Returns `true` when none is pending.
    pub(crate) fn request_eval(&self) -> bool {
        !self.eval_pending.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_pending(&self) {
        self.eval_pending.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
