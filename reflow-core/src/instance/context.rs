//! Evaluation Context
//!
//! Tracks which instance or selector is currently evaluating, so that graph
//! edges created by reads can be attributed to the right dependent.
//!
//! # Implementation
//!
//! We use a thread-local stack of evaluation frames. Entering an evaluation
//! pushes a frame; reads performed while the frame is on top record their
//! dependencies into it; finishing the evaluation pops the frame and hands
//! its contents to the reconciliation step.
//!
//! The stack supports nesting: resolving a dependency for the first time
//! evaluates it inside the outer evaluation, and its reads land in its own
//! frame, not the outer one.
//!
//! A dependency recorded as dynamic is never downgraded by a later
//! static-only read within the same frame — flag merging is a union, and
//! the dynamic bit is sticky.

use std::cell::RefCell;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::ecosystem::Ecosystem;
use crate::error::Result;
use crate::graph::{EdgeFlags, NodeKey};
use crate::selector::Selector;

use super::instance::{EvalReason, InstanceRef};
use super::template::AtomTemplate;

/// Cleanup callback registered during an evaluation, run at destruction.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Deferred side effect registered during an evaluation; may hand back a
/// cleanup.
pub(crate) type EffectFn = Box<dyn FnOnce() -> Option<Cleanup> + Send>;

/// Which injector registered a cleanup; effect cleanups run first on
/// destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InjectorKind {
    Effect,
    Generic,
}

/// A dependency discovered during an evaluation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Discovery {
    pub(crate) flags: EdgeFlags,
    pub(crate) operation: &'static str,
}

/// Everything one evaluation collected.
pub(crate) struct EvalFrame {
    pub(crate) id: NodeKey,
    pub(crate) discovered: IndexMap<NodeKey, Discovery>,
    pub(crate) effects: Vec<EffectFn>,
    pub(crate) cleanups: Vec<(InjectorKind, Cleanup)>,
}

thread_local! {
    static EVAL_STACK: RefCell<Vec<EvalFrame>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the evaluation frame when finished (or when unwinding).
pub(crate) struct FrameGuard {
    id: NodeKey,
    finished: bool,
}

impl FrameGuard {
    /// Push a fresh frame for the given node.
    pub(crate) fn enter(id: NodeKey) -> Self {
        EVAL_STACK.with(|stack| {
            stack.borrow_mut().push(EvalFrame {
                id: id.clone(),
                discovered: IndexMap::new(),
                effects: Vec::new(),
                cleanups: Vec::new(),
            });
        });
        Self {
            id,
            finished: false,
        }
    }

    /// Pop the frame and hand back what the evaluation collected.
    pub(crate) fn finish(mut self) -> EvalFrame {
        self.finished = true;
        let frame = EVAL_STACK
            .with(|stack| stack.borrow_mut().pop())
            .expect("evaluation stack underflow");
        debug_assert_eq!(
            frame.id, self.id,
            "evaluation frame mismatch: expected {}, got {}",
            self.id, frame.id
        );
        frame
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if !self.finished {
            // The factory panicked or errored before `finish`; keep the
            // stack consistent.
            EVAL_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }
}

/// Whether an evaluation frame is active on this thread.
pub(crate) fn is_evaluating() -> bool {
    EVAL_STACK.with(|stack| !stack.borrow().is_empty())
}

/// Record a dependency read into the active frame, merging flags with any
/// earlier read of the same key (dynamic is sticky).
pub(crate) fn record_dependency(key: &NodeKey, flags: EdgeFlags, operation: &'static str) {
    EVAL_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let Some(frame) = stack.last_mut() else {
            return;
        };
        // A node does not depend on itself.
        if frame.id == *key {
            return;
        }
        frame
            .discovered
            .entry(key.clone())
            .and_modify(|existing| existing.flags |= flags)
            .or_insert(Discovery { flags, operation });
    });
}

pub(crate) fn record_effect(effect: EffectFn) {
    EVAL_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            frame.effects.push(effect);
        }
    });
}

pub(crate) fn record_cleanup(kind: InjectorKind, cleanup: Cleanup) {
    EVAL_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            frame.cleanups.push((kind, cleanup));
        }
    });
}

/// The handle a factory or selector function receives while evaluating.
///
/// Reads performed through it register graph edges from the evaluating node
/// to the referenced node: dynamic for [`get`](Self::get) and
/// [`select`](Self::select), static for [`get_instance`](Self::get_instance).
pub struct EvalContext<'a> {
    ecosystem: &'a Ecosystem,
    id: NodeKey,
    params: &'a [Value],
    reasons: &'a [EvalReason],
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(
        ecosystem: &'a Ecosystem,
        id: NodeKey,
        params: &'a [Value],
        reasons: &'a [EvalReason],
    ) -> Self {
        Self {
            ecosystem,
            id,
            params,
            reasons,
        }
    }

    /// The ecosystem this evaluation runs in.
    pub fn ecosystem(&self) -> &Ecosystem {
        self.ecosystem
    }

    /// The evaluating node's id.
    pub fn id(&self) -> &NodeKey {
        &self.id
    }

    /// The instance's parameter tuple.
    pub fn params(&self) -> &[Value] {
        self.params
    }

    /// Why this evaluation is running. Empty on the first evaluation.
    pub fn reasons(&self) -> &[EvalReason] {
        self.reasons
    }

    /// Read another atom's state, registering a dynamic edge: this node
    /// re-evaluates when the dependency's state changes.
    pub fn get(&mut self, template: &AtomTemplate, params: &[Value]) -> Result<Arc<Value>> {
        self.ecosystem.get(template, params)
    }

    /// Get another atom's instance handle, registering a static edge: the
    /// dependency is kept alive but its changes do not re-evaluate this node.
    pub fn get_instance(
        &mut self,
        template: &AtomTemplate,
        params: &[Value],
    ) -> Result<InstanceRef> {
        self.ecosystem.get_instance(template, params)
    }

    /// Read a cached derived value, registering a dynamic edge.
    pub fn select(&mut self, selector: &Selector, args: &[Value]) -> Result<Arc<Value>> {
        self.ecosystem.select(selector, args)
    }

    /// Register a deferred side effect. It runs as a `RunEffect` job after
    /// this evaluation settles — after all pending evaluations and external
    /// notifications — and may hand back a cleanup to run at destruction.
    pub fn effect<F>(&mut self, effect: F)
    where
        F: FnOnce() -> Option<Cleanup> + Send + 'static,
    {
        record_effect(Box::new(effect));
    }

    /// Register a cleanup to run when this instance is destroyed.
    pub fn on_cleanup<F>(&mut self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        record_cleanup(InjectorKind::Generic, Box::new(cleanup));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_nest_and_unwind() {
        let outer = NodeKey::new("outer");
        let inner = NodeKey::new("inner");

        assert!(!is_evaluating());

        let outer_guard = FrameGuard::enter(outer.clone());
        assert!(is_evaluating());
        record_dependency(&NodeKey::new("outer-dep"), EdgeFlags::DYNAMIC, "get");

        {
            let inner_guard = FrameGuard::enter(inner.clone());
            record_dependency(&NodeKey::new("inner-dep"), EdgeFlags::DYNAMIC, "get");
            let frame = inner_guard.finish();
            assert_eq!(frame.id, inner);
            // The inner frame saw only its own reads.
            assert_eq!(frame.discovered.len(), 1);
            assert!(frame.discovered.contains_key(&NodeKey::new("inner-dep")));
        }

        let frame = outer_guard.finish();
        assert_eq!(frame.id, outer);
        assert_eq!(frame.discovered.len(), 1);
        assert!(frame.discovered.contains_key(&NodeKey::new("outer-dep")));
        assert!(!is_evaluating());
    }

    #[test]
    fn dependencies_record_into_the_top_frame() {
        let guard = FrameGuard::enter(NodeKey::new("consumer"));

        record_dependency(&NodeKey::new("a"), EdgeFlags::DYNAMIC, "get");
        record_dependency(&NodeKey::new("b"), EdgeFlags::default(), "get_instance");

        let frame = guard.finish();
        assert_eq!(frame.discovered.len(), 2);
        assert!(frame.discovered[&NodeKey::new("a")].flags.is_dynamic());
        assert!(frame.discovered[&NodeKey::new("b")].flags.is_static());
    }

    #[test]
    fn dynamic_reads_are_never_downgraded() {
        let guard = FrameGuard::enter(NodeKey::new("consumer"));
        let key = NodeKey::new("a");

        record_dependency(&key, EdgeFlags::DYNAMIC, "get");
        record_dependency(&key, EdgeFlags::default(), "get_instance");

        let frame = guard.finish();
        assert!(frame.discovered[&key].flags.is_dynamic());
    }

    #[test]
    fn static_then_dynamic_upgrades() {
        let guard = FrameGuard::enter(NodeKey::new("consumer"));
        let key = NodeKey::new("a");

        record_dependency(&key, EdgeFlags::default(), "get_instance");
        record_dependency(&key, EdgeFlags::DYNAMIC, "get");

        let frame = guard.finish();
        assert!(frame.discovered[&key].flags.is_dynamic());
    }

    #[test]
    fn self_reads_are_ignored() {
        let key = NodeKey::new("self");
        let guard = FrameGuard::enter(key.clone());

        record_dependency(&key, EdgeFlags::DYNAMIC, "get");

        let frame = guard.finish();
        assert!(frame.discovered.is_empty());
    }

    #[test]
    fn dropping_an_unfinished_guard_pops_the_frame() {
        {
            let _guard = FrameGuard::enter(NodeKey::new("panicky"));
            assert!(is_evaluating());
        }
        assert!(!is_evaluating());
    }
}
