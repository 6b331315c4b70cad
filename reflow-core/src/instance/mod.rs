//! Instance Lifecycle
//!
//! This module defines atom templates, the evaluation context factories run
//! inside, and the instance state machine. The evaluation and destruction
//! algorithms that need the graph, scheduler, and registry live on the
//! ecosystem; this module owns the data they operate on.

mod context;
mod instance;
mod template;

pub use context::{Cleanup, EvalContext};
pub use instance::{EvalReason, InstanceRef, InstanceStatus, PromiseStatus, ReasonKind};
pub use template::{
    AtomConfig, AtomTemplate, AtomValue, ExternalTtl, Factory, StateTransform, Ttl, TtlTrigger,
};

pub(crate) use context::{is_evaluating, record_dependency, Discovery, FrameGuard, InjectorKind};
pub(crate) use instance::{Backing, InstanceInner};
