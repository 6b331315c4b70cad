//! Reflow Core
//!
//! This crate provides the core runtime for the Reflow reactive state engine.
//! It implements:
//!
//! - A dependency graph of addressable, versioned computation nodes
//! - A single-threaded, run-to-completion job scheduler
//! - Atom instances: factory-backed state cells with lifecycle and TTL
//! - Composable state containers with reducer hierarchies and delegation
//! - A memoized derived-value cache layered on the same graph machinery
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: dependency tracking — nodes, edges, weights, propagation
//! - `scheduler`: the ordered job queue and the TTL timer wheel
//! - `container`: mutable state cells and the hierarchy composition engine
//! - `instance`: atom templates, evaluation contexts, instance lifecycle
//! - `selector`: the derived-value cache
//! - `ecosystem`: the isolation boundary tying everything together
//! - `snapshot`: dehydrate/hydrate persistence of instance state
//!
//! # Example
//!
//! ```rust,ignore
//! use reflow_core::{AtomTemplate, AtomValue, EcosystemConfig};
//! use serde_json::json;
//!
//! let ecosystem = EcosystemConfig::new().id("app").build();
//!
//! // An atom holding a plain value
//! let count = AtomTemplate::new("count", |_ctx| Ok(AtomValue::Value(json!(0))));
//!
//! // An atom derived from it
//! let doubled = {
//!     let count = count.clone();
//!     AtomTemplate::new("doubled", move |ctx| {
//!         let n = ctx.get(&count, &[])?.as_i64().unwrap_or(0);
//!         Ok(AtomValue::Value(json!(n * 2)))
//!     })
//! };
//!
//! assert_eq!(*ecosystem.get(&doubled, &[]).unwrap(), json!(0));
//!
//! // Updating `count` re-evaluates `doubled` before control returns
//! let instance = ecosystem.get_instance(&count, &[]).unwrap();
//! instance.container().set_state(json!(21)).unwrap();
//! assert_eq!(*ecosystem.get(&doubled, &[]).unwrap(), json!(42));
//! ```

pub mod action;
pub mod container;
pub mod ecosystem;
pub mod error;
pub mod graph;
pub mod instance;
pub mod scheduler;
pub mod selector;
pub mod snapshot;

pub use action::{Action, ActionChain};
pub use container::{Container, Hierarchy, Reducer, Subscription};
pub use ecosystem::{
    ecosystem, Ecosystem, EcosystemConfig, ExternalSubscription, GhostSubscription, SubscribeMode,
};
pub use error::{Error, Result};
pub use graph::{EdgeFlags, NodeKey, NodeView, Signal, TreeView};
pub use instance::{
    AtomConfig, AtomTemplate, AtomValue, EvalContext, EvalReason, InstanceRef, InstanceStatus,
    PromiseStatus, ReasonKind, Ttl, TtlTrigger,
};
pub use scheduler::{Clock, ManualClock, SystemClock};
pub use selector::Selector;
pub use snapshot::{DehydrateOptions, HydrateOptions, Snapshot};
