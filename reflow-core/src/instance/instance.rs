//! Atom Instances
//!
//! An instance is the live binding of a template and a parameter tuple to a
//! backing container and a graph node. This module holds the instance's
//! state machine and bookkeeping; the evaluation and destruction logic that
//! needs the graph, scheduler, and registry lives on the ecosystem.
//!
//! # Lifecycle
//!
//! `Initializing → Active → (Stale →) Destroyed`
//!
//! An instance is `Initializing` from construction until its first factory
//! evaluation completes. `Stale` means the last dependent detached and a
//! destruction is pending confirmation (the TTL grace period); re-attaching
//! a dependent before the TTL fires returns it to `Active`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use smallvec::SmallVec;

use crate::container::{Container, Subscription};
use crate::error::Error;
use crate::graph::{EdgeFlags, NodeKey};

use super::context::{Cleanup, InjectorKind};
use super::template::{AtomTemplate, ExternalTtl, Ttl};

/// Where an instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Constructed; the first factory evaluation has not completed yet.
    Initializing,
    /// Evaluated and reachable.
    Active,
    /// Lost its last dependent; destruction is pending confirmation.
    Stale,
    /// Destroyed. Terminal.
    Destroyed,
}

/// Status of a promise forwarded by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    /// No promise has been forwarded.
    None,
    /// The promise has not settled.
    Pending,
    /// The promise resolved.
    Resolved,
    /// The promise rejected; the rejection is the instance's error state.
    Rejected,
}

#[derive(Debug, Clone)]
enum PromiseState {
    None,
    Pending,
    Resolved,
    Rejected(String),
}

/// Why an evaluation was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonKind {
    /// A dynamic dependency's state changed.
    StateChanged,
    /// An explicit invalidation was requested.
    CacheInvalidated,
    /// The evaluation was forced programmatically.
    Forced,
}

/// One accumulated evaluation reason. Reasons are batched: however many
/// accumulate before the evaluation job runs, only one job is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalReason {
    /// What kind of event triggered it.
    pub kind: ReasonKind,
    /// The node whose change triggered it, when there is one.
    pub source: Option<NodeKey>,
}

/// How an instance's state is backed: a container the framework created for
/// a plain value, or one the factory supplied. Fixed at first evaluation.
pub(crate) enum Backing {
    Provided(Container),
    User(Container),
}

impl Backing {
    pub(crate) fn container(&self) -> &Container {
        match self {
            Self::Provided(container) | Self::User(container) => container,
        }
    }
}

pub(crate) struct InstanceInner {
    id: NodeKey,
    template: AtomTemplate,
    params: Vec<Value>,
    param_token: Option<u64>,
    status: RwLock<InstanceStatus>,
    pub(crate) backing: RwLock<Option<Backing>>,
    /// The dependency edges established by the most recent evaluation.
    pub(crate) tracked: Mutex<IndexMap<NodeKey, EdgeFlags>>,
    reasons: Mutex<SmallVec<[EvalReason; 4]>>,
    eval_pending: AtomicBool,
    cleanups: Mutex<Vec<(InjectorKind, Cleanup)>>,
    promise: RwLock<PromiseState>,
    ttl_override: RwLock<Option<Ttl>>,
    destruction_generation: AtomicU64,
    armed_ttl: Mutex<Option<ExternalTtl>>,
    container_subscription: Mutex<Option<Subscription>>,
}

impl InstanceInner {
    pub(crate) fn new(
        id: NodeKey,
        template: AtomTemplate,
        params: Vec<Value>,
        param_token: Option<u64>,
    ) -> Self {
        Self {
            id,
            template,
            params,
            param_token,
            status: RwLock::new(InstanceStatus::Initializing),
            backing: RwLock::new(None),
            tracked: Mutex::new(IndexMap::new()),
            reasons: Mutex::new(SmallVec::new()),
            eval_pending: AtomicBool::new(false),
            cleanups: Mutex::new(Vec::new()),
            promise: RwLock::new(PromiseState::None),
            ttl_override: RwLock::new(None),
            destruction_generation: AtomicU64::new(0),
            armed_ttl: Mutex::new(None),
            container_subscription: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &NodeKey {
        &self.id
    }

    pub(crate) fn template(&self) -> &AtomTemplate {
        &self.template
    }

    pub(crate) fn params(&self) -> &[Value] {
        &self.params
    }

    pub(crate) fn param_token(&self) -> Option<u64> {
        self.param_token
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: InstanceStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn container_handle(&self) -> Option<Container> {
        self.backing.read().as_ref().map(|b| b.container().clone())
    }

    pub(crate) fn current_state(&self) -> Arc<Value> {
        self.backing
            .read()
            .as_ref()
            .map(|b| b.container().get_state())
            .unwrap_or_else(|| Arc::new(Value::Null))
    }

    /// Append a reason. Returns `true` when no evaluation job is pending
    /// yet — the caller then enqueues exactly one.
    pub(crate) fn push_reason(&self, reason: EvalReason) -> bool {
        self.reasons.lock().push(reason);
        !self.eval_pending.swap(true, Ordering::SeqCst)
    }

    /// Clear the pending flag and take the accumulated reasons. Reasons that
    /// arrive after this point schedule a fresh job.
    pub(crate) fn take_reasons(&self) -> SmallVec<[EvalReason; 4]> {
        self.eval_pending.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.reasons.lock())
    }

    pub(crate) fn absorb_cleanups(&self, cleanups: Vec<(InjectorKind, Cleanup)>) {
        self.cleanups.lock().extend(cleanups);
    }

    /// Take every registered cleanup, effect-kind first.
    pub(crate) fn take_cleanups_ordered(&self) -> Vec<Cleanup> {
        let mut cleanups = std::mem::take(&mut *self.cleanups.lock());
        let mut ordered = Vec::with_capacity(cleanups.len());
        for kind in [InjectorKind::Effect, InjectorKind::Generic] {
            let mut i = 0;
            while i < cleanups.len() {
                if cleanups[i].0 == kind {
                    ordered.push(cleanups.remove(i).1);
                } else {
                    i += 1;
                }
            }
        }
        ordered
    }

    pub(crate) fn generation(&self) -> u64 {
        self.destruction_generation.load(Ordering::SeqCst)
    }

    /// Invalidate any outstanding destruction timer or external TTL entry.
    pub(crate) fn bump_generation(&self) -> u64 {
        self.destruction_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_armed_ttl(&self, ttl: ExternalTtl) {
        *self.armed_ttl.lock() = Some(ttl);
    }

    pub(crate) fn take_armed_ttl(&self) -> Option<ExternalTtl> {
        self.armed_ttl.lock().take()
    }

    pub(crate) fn set_container_subscription(&self, subscription: Subscription) {
        *self.container_subscription.lock() = Some(subscription);
    }

    pub(crate) fn drop_container_subscription(&self) {
        self.container_subscription.lock().take();
    }

    /// The TTL in force: the instance override, then the template's
    /// configured TTL, then the ecosystem default.
    pub(crate) fn resolve_ttl(&self, ecosystem_default: &Ttl) -> Ttl {
        if let Some(ttl) = self.ttl_override.read().clone() {
            return ttl;
        }
        if let Some(ttl) = self.template.config().ttl.clone() {
            return ttl;
        }
        ecosystem_default.clone()
    }

    pub(crate) fn set_ttl_override(&self, ttl: Ttl) {
        *self.ttl_override.write() = Some(ttl);
    }

    pub(crate) fn set_promise_state_pending(&self) {
        *self.promise.write() = PromiseState::Pending;
    }

    pub(crate) fn resolve_promise_state(&self) {
        *self.promise.write() = PromiseState::Resolved;
    }

    pub(crate) fn reject_promise_state(&self, message: String) {
        *self.promise.write() = PromiseState::Rejected(message);
    }

    pub(crate) fn promise_status(&self) -> PromiseStatus {
        match &*self.promise.read() {
            PromiseState::None => PromiseStatus::None,
            PromiseState::Pending => PromiseStatus::Pending,
            PromiseState::Resolved => PromiseStatus::Resolved,
            PromiseState::Rejected(_) => PromiseStatus::Rejected,
        }
    }

    pub(crate) fn promise_error(&self) -> Option<Error> {
        match &*self.promise.read() {
            PromiseState::Rejected(message) => Some(Error::PromiseRejected {
                id: self.id.as_str().to_string(),
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

/// Public handle to a live instance.
#[derive(Clone)]
pub struct InstanceRef {
    pub(crate) inner: Arc<InstanceInner>,
}

impl InstanceRef {
    /// The instance's id (template key, plus a parameter token if any).
    pub fn id(&self) -> &NodeKey {
        self.inner.id()
    }

    /// The template this instance was created from.
    pub fn template(&self) -> &AtomTemplate {
        self.inner.template()
    }

    /// The parameter tuple this instance was created with.
    pub fn params(&self) -> &[Value] {
        self.inner.params()
    }

    /// Where the instance is in its lifecycle.
    pub fn status(&self) -> InstanceStatus {
        self.inner.status()
    }

    /// The instance's current state.
    pub fn state(&self) -> Arc<Value> {
        self.inner.current_state()
    }

    /// The backing container. Available on any handle the ecosystem hands
    /// out — the first evaluation has completed by then.
    pub fn container(&self) -> Container {
        self.inner
            .container_handle()
            .expect("instance has no backing container")
    }

    /// Override the TTL for this instance, taking precedence over the
    /// template's configuration and the ecosystem default.
    pub fn set_ttl(&self, ttl: Ttl) {
        self.inner.set_ttl_override(ttl);
    }

    /// Status of the forwarded promise, if any.
    pub fn promise_status(&self) -> PromiseStatus {
        self.inner.promise_status()
    }

    /// The recorded rejection, surfaced for suspense-style consumers.
    pub fn promise_error(&self) -> Option<Error> {
        self.inner.promise_error()
    }

    /// Record that this instance forwarded a promise that has not settled.
    pub fn set_promise_pending(&self) {
        self.inner.set_promise_state_pending();
    }

    /// Record that the forwarded promise resolved.
    pub fn resolve_promise(&self) {
        self.inner.resolve_promise_state();
    }

    /// Record that the forwarded promise rejected. The rejection becomes the
    /// instance's error state; it is never thrown during propagation.
    pub fn reject_promise(&self, message: impl Into<String>) {
        self.inner.reject_promise_state(message.into());
    }
}

impl std::fmt::Debug for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRef")
            .field("id", self.id())
            .field("status", &self.status())
            .field("state", &*self.state())
            .finish()
    }
}
