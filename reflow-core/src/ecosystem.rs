//! The Ecosystem
//!
//! An ecosystem is the isolation boundary tying the engine together: one
//! graph, one scheduler, one timer wheel, one instance registry, one
//! parameter-interning table. Everything is an explicit context object
//! passed by reference into every operation — there is no module-level
//! mutable state per ecosystem, so multiple independent ecosystems coexist
//! (the usual testing pattern).
//!
//! # How Updates Flow
//!
//! 1. A container state change notifies its owning instance's subscription.
//! 2. The graph classifies the instance's dependents: static edges are
//!    skipped, internal dynamic edges become evaluation jobs ordered by
//!    weight, external edges become notification jobs ordered by flag score.
//! 3. The scheduler drains: each evaluation runs the factory inside an
//!    evaluation frame, reconciles discovered edges against the previous
//!    set, and may write containers — repeating the cycle until the queue
//!    is empty. Control only then returns to the caller.
//!
//! # Thread Model
//!
//! Execution is single-threaded and cooperative. The locks below guard
//! reentrancy (a job calling back into the ecosystem), not parallelism; no
//! lock is ever held across a call into user code.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::container::{Container, Subscription};
use crate::error::{Error, Result};
use crate::graph::{
    DependentJob, Edge, EdgeCallback, EdgeFlags, Graph, GhostShim, NodeKey, NodeView, Signal,
    TreeView,
};
use crate::instance::{
    is_evaluating, record_dependency, AtomTemplate, AtomValue, Backing, Cleanup, EvalContext,
    EvalReason, FrameGuard, InjectorKind, InstanceInner, InstanceRef, InstanceStatus, ReasonKind,
    Ttl,
};
use crate::scheduler::{Clock, Job, JobKind, Scheduler, SystemClock, Timers};
use crate::selector::{Selector, SelectorItem};
use crate::snapshot::{DehydrateOptions, HydrateOptions, Snapshot};

static ECOSYSTEMS: OnceLock<DashMap<String, Ecosystem>> = OnceLock::new();
static NEXT_ECOSYSTEM_ID: AtomicU64 = AtomicU64::new(0);

fn global_registry() -> &'static DashMap<String, Ecosystem> {
    ECOSYSTEMS.get_or_init(DashMap::new)
}

/// Look up a live ecosystem by id.
pub fn ecosystem(id: &str) -> Option<Ecosystem> {
    global_registry().get(id).map(|entry| entry.value().clone())
}

/// What lives behind a graph node.
#[derive(Clone)]
pub(crate) enum Owner {
    Instance(Arc<InstanceInner>),
    Selector(Arc<SelectorItem>),
}

struct ParamEntry {
    hash: u64,
    refs: usize,
}

/// Interns parameter tuples to opaque identity tokens. An entry lives as
/// long as an instance or cache item owns it.
#[derive(Default)]
struct ParamTable {
    tokens_by_hash: HashMap<u64, u64>,
    entries: HashMap<u64, ParamEntry>,
    next_token: u64,
}

impl ParamTable {
    fn token_for(&mut self, params: &[Value]) -> u64 {
        let hash = hash_params(params);
        if let Some(token) = self.tokens_by_hash.get(&hash) {
            return *token;
        }
        let token = self.next_token;
        self.next_token += 1;
        self.tokens_by_hash.insert(hash, token);
        self.entries.insert(token, ParamEntry { hash, refs: 0 });
        token
    }

    fn retain(&mut self, token: u64) {
        if let Some(entry) = self.entries.get_mut(&token) {
            entry.refs += 1;
        }
    }

    fn release(&mut self, token: u64) {
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            let hash = entry.hash;
            self.entries.remove(&token);
            self.tokens_by_hash.remove(&hash);
        }
    }
}

fn hash_params(params: &[Value]) -> u64 {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

fn run_cleanups_ordered(cleanups: Vec<(InjectorKind, Cleanup)>) {
    let mut effects = Vec::new();
    let mut generics = Vec::new();
    for (kind, cleanup) in cleanups {
        match kind {
            InjectorKind::Effect => effects.push(cleanup),
            InjectorKind::Generic => generics.push(cleanup),
        }
    }
    for cleanup in effects.into_iter().chain(generics) {
        cleanup();
    }
}

pub(crate) struct EcosystemInner {
    id: String,
    graph: RwLock<Graph>,
    scheduler: Scheduler,
    timers: Timers,
    registry: RwLock<HashMap<NodeKey, Owner>>,
    params: Mutex<ParamTable>,
    staged_hydration: Mutex<HashMap<String, Value>>,
    default_ttl: Ttl,
    next_external: AtomicU64,
}

/// Builder for an [`Ecosystem`].
pub struct EcosystemConfig {
    id: Option<String>,
    default_ttl: Ttl,
    clock: Arc<dyn Clock>,
}

impl Default for EcosystemConfig {
    fn default() -> Self {
        Self {
            id: None,
            default_ttl: Ttl::Never,
            clock: Arc::new(SystemClock),
        }
    }
}

impl EcosystemConfig {
    /// Start from defaults: generated id, `Ttl::Never`, the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ecosystem id used for global lookup.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the TTL applied to instances whose template configures none.
    pub fn default_ttl(mut self, ttl: Ttl) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the time source driving TTL deadlines.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the ecosystem and register it for [`ecosystem`] lookup.
    pub fn build(self) -> Ecosystem {
        let id = self.id.unwrap_or_else(|| {
            format!(
                "ecosystem-{}",
                NEXT_ECOSYSTEM_ID.fetch_add(1, Ordering::Relaxed)
            )
        });
        let built = Ecosystem {
            inner: Arc::new(EcosystemInner {
                id: id.clone(),
                graph: RwLock::new(Graph::new()),
                scheduler: Scheduler::new(),
                timers: Timers::new(self.clock),
                registry: RwLock::new(HashMap::new()),
                params: Mutex::new(ParamTable::default()),
                staged_hydration: Mutex::new(HashMap::new()),
                default_ttl: self.default_ttl,
                next_external: AtomicU64::new(0),
            }),
        };
        global_registry().insert(id, built.clone());
        built
    }
}

/// Handle to one isolated engine: graph + scheduler + registries.
#[derive(Clone)]
pub struct Ecosystem {
    pub(crate) inner: Arc<EcosystemInner>,
}

impl Ecosystem {
    /// The ecosystem's id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Read an atom's state, creating the instance on first use.
    ///
    /// Called during an evaluation, this registers a dynamic edge from the
    /// evaluating node; called from outside, it is a plain read.
    pub fn get(&self, template: &AtomTemplate, params: &[Value]) -> Result<Arc<Value>> {
        let instance = self.resolve_instance(template, params)?;
        if is_evaluating() {
            record_dependency(instance.id(), EdgeFlags::DYNAMIC, "get");
        }
        Ok(instance.current_state())
    }

    /// Get an atom's instance handle, creating it on first use. Registers a
    /// static edge when called during an evaluation: the dependency is kept
    /// alive but its changes do not re-evaluate the caller.
    pub fn get_instance(&self, template: &AtomTemplate, params: &[Value]) -> Result<InstanceRef> {
        let instance = self.resolve_instance(template, params)?;
        if is_evaluating() {
            record_dependency(instance.id(), EdgeFlags::default(), "get_instance");
        }
        Ok(InstanceRef { inner: instance })
    }

    /// Read a derived value. Inside an evaluation the result is cached in
    /// the graph and a dynamic edge is registered; outside, the computation
    /// runs statelessly.
    pub fn select(&self, selector: &Selector, args: &[Value]) -> Result<Arc<Value>> {
        if is_evaluating() {
            let item = self.resolve_selector(selector, args)?;
            record_dependency(item.id(), EdgeFlags::DYNAMIC, "select");
            return Ok(item.value());
        }

        let key = NodeKey::new(format!("@@selector-run-{}", selector.key()));
        let mut context = EvalContext::new(self, key, args, &[]);
        (selector.compute().as_ref())(&mut context, args).map(Arc::new)
    }

    /// Force a re-evaluation with a "cache invalidated" reason. The
    /// evaluation runs now: at the front of the queue if a flush is active,
    /// immediately otherwise.
    pub fn invalidate(&self, instance: &InstanceRef) {
        let inner = &instance.inner;
        if inner.status() == InstanceStatus::Destroyed {
            return;
        }
        if !inner.push_reason(EvalReason {
            kind: ReasonKind::CacheInvalidated,
            source: None,
        }) {
            return;
        }

        let kind = JobKind::EvaluateNode {
            key: inner.id().clone(),
            weight: self.inner.graph.read().weight_of(inner.id()),
        };
        if self.inner.scheduler.is_flushing() {
            self.inner.scheduler.push_front(kind);
        } else {
            self.inner.scheduler.schedule(kind);
            self.flush();
        }
    }

    /// Destroy an instance. Without `force`, bails while dependents remain.
    pub fn destroy_instance(&self, instance: &InstanceRef, force: bool) {
        self.destroy_instance_inner(&instance.inner, force);
        self.flush();
    }

    /// Register an external subscription against an instance. The callback
    /// receives `(signal, state)` on updates (dynamic mode only) and on
    /// destruction. Dropping the returned handle unregisters.
    pub fn subscribe<F>(
        &self,
        instance: &InstanceRef,
        mode: SubscribeMode,
        callback: F,
    ) -> ExternalSubscription
    where
        F: Fn(Signal, &Arc<Value>) + Send + Sync + 'static,
    {
        self.subscribe_with(
            instance,
            mode,
            EdgeCallback::Direct(Arc::new(callback)),
            EdgeFlags::default(),
        )
    }

    /// Like [`subscribe`](Self::subscribe), but marks the edge async: the
    /// callback defers its real work, so its notifications run after those
    /// of synchronous subscribers within a flush.
    pub fn subscribe_async<F>(
        &self,
        instance: &InstanceRef,
        mode: SubscribeMode,
        callback: F,
    ) -> ExternalSubscription
    where
        F: Fn(Signal, &Arc<Value>) + Send + Sync + 'static,
    {
        self.subscribe_with(
            instance,
            mode,
            EdgeCallback::Direct(Arc::new(callback)),
            EdgeFlags::ASYNC,
        )
    }

    /// Like [`subscribe`](Self::subscribe), but speculative: notifications
    /// are buffered until the ghost is materialized or discarded.
    pub fn ghost_subscribe<F>(
        &self,
        instance: &InstanceRef,
        mode: SubscribeMode,
        callback: F,
    ) -> GhostSubscription
    where
        F: Fn(Signal, &Arc<Value>) + Send + Sync + 'static,
    {
        let shim = GhostShim::new(Arc::new(callback));
        let subscription = self.subscribe_with(
            instance,
            mode,
            EdgeCallback::Ghost(Arc::clone(&shim)),
            EdgeFlags::GHOST,
        );
        GhostSubscription { shim, subscription }
    }

    /// Confirm TTL deadlines that have passed on this ecosystem's clock.
    /// The host pumps this; the engine never blocks on time.
    pub fn run_due_timers(&self) {
        if self.inner.timers.is_empty() {
            return;
        }
        for (key, generation) in self.inner.timers.drain_due() {
            self.confirm_destruction(&key, generation);
        }
        self.flush();
    }

    /// Serialize the state of every instance passing the filters.
    pub fn dehydrate(&self, options: &DehydrateOptions) -> Snapshot {
        let registry = self.inner.registry.read();
        let mut snapshot = Snapshot::default();

        for (key, owner) in registry.iter() {
            let Owner::Instance(instance) = owner else {
                continue;
            };
            let config = instance.template().config();
            if !options.matches(instance.template().key(), key.as_str(), &config.flags) {
                continue;
            }
            let mut value = instance.current_state().as_ref().clone();
            if let Some(transform) = &config.serialize {
                value = transform(&value);
            }
            snapshot.0.insert(key.as_str().to_string(), value);
        }

        debug!(count = snapshot.len(), "dehydrated");
        snapshot
    }

    /// Apply a snapshot: live matching instances get a full state
    /// replacement (through the template's inverse transform) when
    /// `retroactive`; everything else is staged for future initializations.
    pub fn hydrate(&self, snapshot: &Snapshot, options: &HydrateOptions) -> Result<()> {
        for (id, value) in &snapshot.0 {
            let owner = self.inner.registry.read().get(&NodeKey::new(id)).cloned();
            match owner {
                Some(Owner::Instance(instance)) if options.retroactive => {
                    let config = instance.template().config();
                    let restored = match &config.deserialize {
                        Some(transform) => transform(value),
                        None => value.clone(),
                    };
                    if let Some(container) = instance.container_handle() {
                        container.set_state(restored)?;
                    }
                }
                _ => {
                    self.inner
                        .staged_hydration
                        .lock()
                        .insert(id.clone(), value.clone());
                }
            }
        }
        self.flush();
        Ok(())
    }

    /// Flat inspection view of the graph.
    pub fn flat_view(&self) -> Vec<NodeView> {
        self.inner.graph.read().flat_view()
    }

    /// Recursive view from root producers down through their dependents.
    pub fn top_down_view(&self) -> Vec<TreeView> {
        self.inner.graph.read().top_down_view()
    }

    /// Recursive view from leaf consumers up through their dependencies.
    pub fn bottom_up_view(&self) -> Vec<TreeView> {
        self.inner.graph.read().bottom_up_view()
    }

    /// Force-destroy every instance and deregister the ecosystem.
    pub fn destroy(&self) {
        debug!(id = %self.inner.id, "destroying ecosystem");
        let owners: Vec<Owner> = self.inner.registry.read().values().cloned().collect();
        for owner in owners {
            match owner {
                Owner::Instance(instance) => self.destroy_instance_inner(&instance, true),
                Owner::Selector(item) => self.destroy_selector_item(&item),
            }
        }
        self.flush();
        global_registry().remove(&self.inner.id);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn instance_key(&self, template_key: &str, params: &[Value]) -> (NodeKey, Option<u64>) {
        if params.is_empty() {
            (NodeKey::new(template_key), None)
        } else {
            let token = self.inner.params.lock().token_for(params);
            (NodeKey::new(format!("{template_key}-[{token}]")), Some(token))
        }
    }

    fn selector_key(&self, selector: &Selector, args: &[Value]) -> (NodeKey, Option<u64>) {
        if args.is_empty() {
            (NodeKey::new(format!("@@selector-{}", selector.key())), None)
        } else {
            let token = self.inner.params.lock().token_for(args);
            (
                NodeKey::new(format!("@@selector-{}-[{}]", selector.key(), token)),
                Some(token),
            )
        }
    }

    fn resolve_instance(
        &self,
        template: &AtomTemplate,
        params: &[Value],
    ) -> Result<Arc<InstanceInner>> {
        let (key, token) = self.instance_key(template.key(), params);

        if let Some(Owner::Instance(instance)) = self.inner.registry.read().get(&key).cloned() {
            return Ok(instance);
        }

        debug!(id = %key, "creating instance");
        let instance = Arc::new(InstanceInner::new(
            key.clone(),
            template.clone(),
            params.to_vec(),
            token,
        ));
        if let Some(token) = token {
            self.inner.params.lock().retain(token);
        }
        self.inner.graph.write().add_node(key.clone());
        self.inner
            .registry
            .write()
            .insert(key.clone(), Owner::Instance(Arc::clone(&instance)));

        if let Err(error) = self.evaluate_instance(&instance, &[]) {
            self.teardown_failed(&key, instance.param_token());
            instance.set_status(InstanceStatus::Destroyed);
            return Err(error);
        }

        let staged = self.inner.staged_hydration.lock().remove(key.as_str());
        if let Some(value) = staged {
            let restored = match &template.config().deserialize {
                Some(transform) => transform(&value),
                None => value,
            };
            if let Some(container) = instance.container_handle() {
                container.set_state(restored)?;
            }
        }

        self.flush();
        Ok(instance)
    }

    fn resolve_selector(&self, selector: &Selector, args: &[Value]) -> Result<Arc<SelectorItem>> {
        let (key, token) = self.selector_key(selector, args);

        if let Some(Owner::Selector(item)) = self.inner.registry.read().get(&key).cloned() {
            return Ok(item);
        }

        debug!(id = %key, "creating selector cache item");
        let item = Arc::new(SelectorItem::new(
            key.clone(),
            selector.clone(),
            args.to_vec(),
            token,
        ));
        if let Some(token) = token {
            self.inner.params.lock().retain(token);
        }
        self.inner.graph.write().add_node(key.clone());
        self.inner
            .registry
            .write()
            .insert(key.clone(), Owner::Selector(Arc::clone(&item)));

        if let Err(error) = self.recompute_selector(&item, true) {
            item.mark_destroyed();
            self.teardown_failed(&key, item.param_token());
            return Err(error);
        }
        Ok(item)
    }

    fn teardown_failed(&self, key: &NodeKey, token: Option<u64>) {
        self.inner.registry.write().remove(key);
        let orphaned = self.inner.graph.write().remove_node(key);
        if let Some(token) = token {
            self.inner.params.lock().release(token);
        }
        for dependency in orphaned {
            self.handle_orphaned(&dependency);
        }
    }

    pub(crate) fn evaluate_instance(
        &self,
        instance: &Arc<InstanceInner>,
        reasons: &[EvalReason],
    ) -> Result<()> {
        trace!(id = %instance.id(), reasons = reasons.len(), "evaluating");

        let guard = FrameGuard::enter(instance.id().clone());
        let mut context = EvalContext::new(self, instance.id().clone(), instance.params(), reasons);
        let produced = (instance.template().factory().as_ref())(&mut context);
        let frame = guard.finish();

        let produced = match produced {
            Ok(value) => value,
            Err(error) => {
                // The partial evaluation's injector cleanups still run, then
                // the error propagates unretried.
                run_cleanups_ordered(frame.cleanups);
                return Err(error);
            }
        };

        if let Err(error) = self.apply_backing(instance, produced) {
            run_cleanups_ordered(frame.cleanups);
            return Err(error);
        }

        instance.absorb_cleanups(frame.cleanups);

        for effect in frame.effects {
            let weak = Arc::downgrade(instance);
            self.inner.scheduler.schedule(JobKind::RunEffect {
                task: Box::new(move || {
                    let Some(instance) = weak.upgrade() else {
                        return;
                    };
                    if instance.status() == InstanceStatus::Destroyed {
                        return;
                    }
                    if let Some(cleanup) = effect() {
                        instance.absorb_cleanups(vec![(InjectorKind::Effect, cleanup)]);
                    }
                }),
            });
        }

        self.reconcile_edges(instance.id(), &instance.tracked, frame.discovered);

        if instance.status() == InstanceStatus::Initializing {
            instance.set_status(InstanceStatus::Active);
        }
        Ok(())
    }

    /// Fix or verify the instance's backing per the type-stability rule,
    /// applying the factory's buffered self-update after the frame popped.
    fn apply_backing(&self, instance: &Arc<InstanceInner>, produced: AtomValue) -> Result<()> {
        let mut backing_guard = instance.backing.write();

        if backing_guard.is_none() {
            let backing = match produced {
                AtomValue::Value(value) => {
                    let container = Container::new(format!("@@container-{}", instance.id()));
                    container.set_state(value)?;
                    Backing::Provided(container)
                }
                AtomValue::Container(container) => Backing::User(container),
            };
            let subscription = self.subscribe_backing(instance, backing.container());
            instance.set_container_subscription(subscription);
            *backing_guard = Some(backing);
            return Ok(());
        }

        let update = match (backing_guard.as_ref().expect("backing checked above"), produced) {
            (Backing::Provided(container), AtomValue::Value(value)) => {
                Some((container.clone(), value))
            }
            (Backing::User(container), AtomValue::Container(other))
                if container.ptr_eq(&other) =>
            {
                None
            }
            _ => {
                return Err(Error::BackingKindChanged {
                    id: instance.id().as_str().to_string(),
                })
            }
        };
        drop(backing_guard);

        if let Some((container, value)) = update {
            // The factory's own update, buffered during evaluation, flushes
            // as a single notification now.
            container.set_state(value)?;
        }
        Ok(())
    }

    fn subscribe_backing(
        &self,
        instance: &Arc<InstanceInner>,
        container: &Container,
    ) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        let key = instance.id().clone();
        container.subscribe(move |_chain, _new, _old| {
            if let Some(inner) = weak.upgrade() {
                Ecosystem { inner }.on_node_changed(&key);
            }
        })
    }

    /// A node's value changed: schedule its dynamic dependents and drain.
    pub(crate) fn on_node_changed(&self, key: &NodeKey) {
        let jobs = self.inner.graph.read().schedule_dependents(key);
        for job in jobs {
            match job {
                DependentJob::Evaluate {
                    key: dependent,
                    weight,
                } => {
                    let owner = self.inner.registry.read().get(&dependent).cloned();
                    match owner {
                        Some(Owner::Instance(instance)) => self.schedule_instance_evaluation(
                            &instance,
                            weight,
                            EvalReason {
                                kind: ReasonKind::StateChanged,
                                source: Some(key.clone()),
                            },
                        ),
                        Some(Owner::Selector(item)) => {
                            self.schedule_selector_evaluation(&item, weight);
                        }
                        None => {}
                    }
                }
                DependentJob::Notify {
                    dependency,
                    dependent,
                    flag_score,
                } => {
                    self.inner.scheduler.schedule(JobKind::NotifyExternal {
                        dependency,
                        dependent,
                        flag_score,
                    });
                }
            }
        }
        self.flush();
    }

    fn schedule_instance_evaluation(
        &self,
        instance: &Arc<InstanceInner>,
        weight: u64,
        reason: EvalReason,
    ) {
        if instance.status() == InstanceStatus::Destroyed {
            return;
        }
        // Reasons batch: only the first one in enqueues a job.
        if instance.push_reason(reason) {
            self.inner.scheduler.schedule(JobKind::EvaluateNode {
                key: instance.id().clone(),
                weight,
            });
        }
    }

    fn schedule_selector_evaluation(&self, item: &Arc<SelectorItem>, weight: u64) {
        if item.is_destroyed() {
            return;
        }
        if item.request_eval() {
            self.inner.scheduler.schedule(JobKind::EvaluateNode {
                key: item.id().clone(),
                weight,
            });
        }
    }

    /// Drain the queue. A no-op when a flush is already running — the outer
    /// loop picks up whatever was scheduled.
    pub(crate) fn flush(&self) {
        if !self.inner.scheduler.begin_flush() {
            return;
        }
        while let Some(job) = self.inner.scheduler.pop() {
            self.run_job(job);
        }
        self.inner.scheduler.end_flush();
    }

    fn run_job(&self, job: Job) {
        trace!(job = ?job.kind, "running job");
        match job.kind {
            JobKind::EvaluateNode { key, .. } => {
                let owner = self.inner.registry.read().get(&key).cloned();
                match owner {
                    Some(Owner::Instance(instance)) => {
                        let reasons = instance.take_reasons();
                        if instance.status() == InstanceStatus::Destroyed {
                            return;
                        }
                        if let Err(e) = self.evaluate_instance(&instance, &reasons) {
                            if matches!(e, Error::BackingKindChanged { .. }) {
                                // Not recoverable for this instance.
                                error!(id = %key, error = %e, "backing kind changed; destroying instance");
                                self.destroy_instance_inner(&instance, true);
                            } else {
                                error!(id = %key, error = %e, "re-evaluation failed; keeping previous state");
                            }
                        }
                    }
                    Some(Owner::Selector(item)) => {
                        item.clear_pending();
                        if item.is_destroyed() {
                            return;
                        }
                        if let Err(e) = self.recompute_selector(&item, false) {
                            error!(id = %key, error = %e, "selector recomputation failed; keeping previous value");
                        }
                    }
                    None => {}
                }
            }
            JobKind::NotifyExternal {
                dependency,
                dependent,
                ..
            } => {
                let callback = self
                    .inner
                    .graph
                    .read()
                    .external_edge(&dependency, &dependent)
                    .and_then(|edge| edge.callback.clone());
                let Some(callback) = callback else {
                    // The subscriber unregistered while the job was queued.
                    return;
                };
                let value = self.state_of(&dependency);
                callback.deliver(Signal::Updated, &value);
            }
            JobKind::RunEffect { task } => task(),
        }
    }

    fn state_of(&self, key: &NodeKey) -> Arc<Value> {
        match self.inner.registry.read().get(key) {
            Some(Owner::Instance(instance)) => instance.current_state(),
            Some(Owner::Selector(item)) => item.value(),
            None => Arc::new(Value::Null),
        }
    }

    fn recompute_selector(&self, item: &Arc<SelectorItem>, initial: bool) -> Result<()> {
        trace!(id = %item.id(), initial, "computing selector");

        let guard = FrameGuard::enter(item.id().clone());
        let mut context = EvalContext::new(self, item.id().clone(), item.args(), &[]);
        let produced = (item.selector().compute().as_ref())(&mut context, item.args());
        let frame = guard.finish();

        if !frame.effects.is_empty() || !frame.cleanups.is_empty() {
            warn!(id = %item.id(), "selectors are pure; registered injectors are ignored");
        }

        let value = produced?;
        self.reconcile_edges(item.id(), &item.tracked, frame.discovered);

        let previous = item.value();
        if !initial && (item.selector().comparator())(previous.as_ref(), &value) {
            // Result considered unchanged: keep the cached identity and
            // suppress downstream propagation.
            return Ok(());
        }

        item.set_value(Arc::new(value));
        if !initial {
            self.on_node_changed(item.id());
        }
        Ok(())
    }

    /// Reconcile the edges discovered by an evaluation against the previous
    /// set: add new ones, remove stale ones, upgrade changed flags in place.
    fn reconcile_edges(
        &self,
        id: &NodeKey,
        tracked: &Mutex<IndexMap<NodeKey, EdgeFlags>>,
        discovered: IndexMap<NodeKey, crate::instance::Discovery>,
    ) {
        let mut revived = Vec::new();
        let mut orphaned = Vec::new();

        {
            let mut tracked = tracked.lock();
            let mut graph = self.inner.graph.write();

            for dependency in tracked.keys() {
                if !discovered.contains_key(dependency)
                    && graph.remove_edge(id, dependency)
                {
                    orphaned.push(dependency.clone());
                }
            }

            for (dependency, discovery) in &discovered {
                match tracked.get(dependency) {
                    None => {
                        let edge = Edge::internal(discovery.flags, discovery.operation);
                        if graph.add_edge(id, dependency, edge) {
                            revived.push(dependency.clone());
                        }
                    }
                    Some(flags) if *flags != discovery.flags => {
                        graph.set_edge_flags(id, dependency, discovery.flags);
                    }
                    _ => {}
                }
            }

            *tracked = discovered
                .iter()
                .map(|(key, discovery)| (key.clone(), discovery.flags))
                .collect();
        }

        for key in revived {
            self.cancel_pending_destruction(&key);
        }
        for key in orphaned {
            self.handle_orphaned(&key);
        }
    }

    /// A node lost its last dependent. Destruction is scheduled per the TTL
    /// in force, never performed synchronously from the edge removal itself
    /// (except for the zero TTL, which destroys immediately by contract).
    fn handle_orphaned(&self, key: &NodeKey) {
        let owner = self.inner.registry.read().get(key).cloned();
        match owner {
            Some(Owner::Selector(item)) => self.destroy_selector_item(&item),
            Some(Owner::Instance(instance)) => {
                if instance.status() == InstanceStatus::Destroyed {
                    return;
                }
                match instance.resolve_ttl(&self.inner.default_ttl) {
                    Ttl::Never => {}
                    Ttl::Zero => self.destroy_instance_inner(&instance, false),
                    Ttl::Millis(ms) => {
                        instance.set_status(InstanceStatus::Stale);
                        let generation = instance.bump_generation();
                        debug!(id = %key, ms, "instance stale; destruction scheduled");
                        self.inner
                            .timers
                            .schedule(key.clone(), generation, Duration::from_millis(ms));
                    }
                    Ttl::External(external) => {
                        instance.set_status(InstanceStatus::Stale);
                        let generation = instance.bump_generation();
                        let weak = Arc::downgrade(&self.inner);
                        let confirm_key = key.clone();
                        external.arm(Box::new(move || {
                            if let Some(inner) = weak.upgrade() {
                                Ecosystem { inner }.confirm_destruction(&confirm_key, generation);
                            }
                        }));
                        instance.set_armed_ttl(external);
                    }
                }
            }
            None => {}
        }
    }

    fn cancel_pending_destruction(&self, key: &NodeKey) {
        if let Some(Owner::Instance(instance)) = self.inner.registry.read().get(key).cloned() {
            instance.bump_generation();
            if let Some(external) = instance.take_armed_ttl() {
                external.cancel();
            }
            if instance.status() == InstanceStatus::Stale {
                debug!(id = %key, "destruction canceled; instance active again");
                instance.set_status(InstanceStatus::Active);
            }
        }
    }

    pub(crate) fn confirm_destruction(&self, key: &NodeKey, generation: u64) {
        let owner = self.inner.registry.read().get(key).cloned();
        if let Some(Owner::Instance(instance)) = owner {
            if instance.generation() == generation && instance.status() == InstanceStatus::Stale {
                self.destroy_instance_inner(&instance, false);
                self.flush();
            }
        }
    }

    fn destroy_instance_inner(&self, instance: &Arc<InstanceInner>, force: bool) {
        if instance.status() == InstanceStatus::Destroyed {
            return;
        }
        let key = instance.id().clone();

        if !force {
            let has_dependents = self
                .inner
                .graph
                .read()
                .node(&key)
                .is_some_and(|node| node.has_dependents());
            if has_dependents {
                return;
            }
        }

        debug!(id = %key, force, "destroying instance");
        instance.set_status(InstanceStatus::Destroyed);
        self.inner.scheduler.cancel_evaluation(&key);

        for cleanup in instance.take_cleanups_ordered() {
            cleanup();
        }

        // Outgoing edges next; dependencies left without dependents get
        // their own destruction scheduled afterwards.
        let mut orphaned = Vec::new();
        {
            let tracked: Vec<NodeKey> = instance.tracked.lock().keys().cloned().collect();
            let mut graph = self.inner.graph.write();
            for dependency in tracked {
                if graph.remove_edge(&key, &dependency) {
                    orphaned.push(dependency);
                }
            }
        }
        instance.tracked.lock().clear();
        instance.drop_container_subscription();

        // Whoever still points at the node hears about the destruction;
        // external subscribers get a final signal.
        let callbacks: Vec<EdgeCallback> = self
            .inner
            .graph
            .read()
            .node(&key)
            .map(|node| {
                node.dependents()
                    .values()
                    .filter_map(|edge| edge.callback.clone())
                    .collect()
            })
            .unwrap_or_default();
        if !callbacks.is_empty() {
            let state = instance.current_state();
            for callback in callbacks {
                callback.deliver(Signal::Destroyed, &state);
            }
        }

        self.inner.graph.write().remove_node(&key);
        self.inner.registry.write().remove(&key);
        if let Some(token) = instance.param_token() {
            self.inner.params.lock().release(token);
        }

        for dependency in orphaned {
            self.handle_orphaned(&dependency);
        }
    }

    fn destroy_selector_item(&self, item: &Arc<SelectorItem>) {
        if item.is_destroyed() {
            return;
        }
        let key = item.id().clone();
        debug!(id = %key, "destroying selector cache item");
        item.mark_destroyed();
        self.inner.scheduler.cancel_evaluation(&key);

        let mut orphaned = Vec::new();
        {
            let tracked: Vec<NodeKey> = item.tracked.lock().keys().cloned().collect();
            let mut graph = self.inner.graph.write();
            for dependency in tracked {
                if graph.remove_edge(&key, &dependency) {
                    orphaned.push(dependency);
                }
            }
        }

        self.inner.graph.write().remove_node(&key);
        self.inner.registry.write().remove(&key);
        if let Some(token) = item.param_token() {
            self.inner.params.lock().release(token);
        }

        for dependency in orphaned {
            self.handle_orphaned(&dependency);
        }
    }

    fn subscribe_with(
        &self,
        instance: &InstanceRef,
        mode: SubscribeMode,
        callback: EdgeCallback,
        extra: EdgeFlags,
    ) -> ExternalSubscription {
        let dependent = NodeKey::new(format!(
            "@@external-{}",
            self.inner.next_external.fetch_add(1, Ordering::Relaxed)
        ));
        let mut flags = EdgeFlags::EXTERNAL | extra;
        if matches!(mode, SubscribeMode::Dynamic) {
            flags |= EdgeFlags::DYNAMIC;
        }

        let revived = self.inner.graph.write().add_edge(
            &dependent,
            instance.id(),
            Edge::external(flags, "subscribe", callback),
        );
        if revived {
            self.cancel_pending_destruction(instance.id());
        }

        ExternalSubscription {
            ecosystem: Arc::downgrade(&self.inner),
            dependent,
            dependency: instance.id().clone(),
            active: AtomicBool::new(true),
        }
    }
}

impl std::fmt::Debug for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecosystem")
            .field("id", &self.inner.id)
            .field("node_count", &self.inner.graph.read().node_count())
            .field("pending_jobs", &self.inner.scheduler.len())
            .finish()
    }
}

/// Whether an external subscription re-runs on updates or only keeps its
/// target alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Receive `Updated` signals and the final `Destroyed` signal.
    Dynamic,
    /// Keep the instance alive; only the `Destroyed` signal is delivered.
    Static,
}

/// Registration handle for an external subscriber. Unregisters on drop.
pub struct ExternalSubscription {
    ecosystem: Weak<EcosystemInner>,
    dependent: NodeKey,
    dependency: NodeKey,
    active: AtomicBool,
}

impl ExternalSubscription {
    /// Remove the edge now instead of waiting for drop. If this was the
    /// target's last dependent, its destruction is scheduled per its TTL.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.ecosystem.upgrade() else {
            return;
        };
        let ecosystem = Ecosystem { inner };
        let orphaned = ecosystem
            .inner
            .graph
            .write()
            .remove_edge(&self.dependent, &self.dependency);
        if orphaned {
            ecosystem.handle_orphaned(&self.dependency);
            ecosystem.flush();
        }
    }
}

impl Drop for ExternalSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A speculative subscription: notifications buffer until the consumer
/// commits ([`materialize`](Self::materialize)) or bails
/// ([`destroy`](Self::destroy)).
pub struct GhostSubscription {
    shim: Arc<GhostShim>,
    subscription: ExternalSubscription,
}

impl GhostSubscription {
    /// Confirm the subscription: the latest buffered notification replays
    /// once and everything from here on forwards directly.
    pub fn materialize(&self) {
        self.shim.materialize();
    }

    /// Discard the subscription: the buffer is dropped, the edge removed.
    pub fn destroy(&self) {
        self.shim.destroy();
        self.subscription.unsubscribe();
    }
}
