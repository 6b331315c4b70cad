//! Atom Templates
//!
//! A template is the static half of an atom: a key, a factory function, and
//! configuration. Binding a template to a parameter tuple inside an
//! ecosystem produces an instance.
//!
//! The factory's return value is a closed tagged union: either a plain value
//! (the framework creates and owns the backing container) or a container the
//! factory supplies itself. The kind is fixed by the first evaluation and
//! checked — not re-inferred — on every subsequent one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::container::Container;
use crate::error::Result;

use super::context::EvalContext;

/// The factory function backing an atom.
pub type Factory = Arc<dyn Fn(&mut EvalContext<'_>) -> Result<AtomValue> + Send + Sync>;

/// Transform applied to instance state on dehydration (and its inverse on
/// hydration).
pub type StateTransform = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// What a factory evaluation produced.
pub enum AtomValue {
    /// A plain state value; the framework provides the backing container.
    Value(Value),
    /// A user-supplied container. Every subsequent evaluation must return
    /// the same container.
    Container(Container),
}

/// Time-to-live policy governing how long an orphaned instance survives.
#[derive(Clone, Default)]
pub enum Ttl {
    /// Never destroy automatically.
    #[default]
    Never,
    /// Destroy immediately on staleness.
    Zero,
    /// Destroy after this many milliseconds unless a dependent re-attaches.
    Millis(u64),
    /// Destroy when an external event settles (a promise resolving, an
    /// observable's first emission), unless canceled first.
    External(ExternalTtl),
}

impl Ttl {
    /// A TTL driven by the host: destruction fires when the returned trigger
    /// settles, unless a dependent re-attached in the meantime.
    pub fn external() -> (Self, TtlTrigger) {
        let inner = Arc::new(ExternalTtlInner {
            canceled: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            on_settle: Mutex::new(None),
        });
        (
            Self::External(ExternalTtl {
                inner: Arc::clone(&inner),
            }),
            TtlTrigger { inner },
        )
    }
}

struct ExternalTtlInner {
    canceled: AtomicBool,
    settled: AtomicBool,
    on_settle: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// The policy half of an external TTL, stored in atom configuration.
#[derive(Clone)]
pub struct ExternalTtl {
    inner: Arc<ExternalTtlInner>,
}

impl ExternalTtl {
    /// Arm the TTL: run `confirm` when the trigger settles. If the trigger
    /// already settled, destruction is confirmed immediately.
    pub(crate) fn arm(&self, confirm: Box<dyn FnOnce() + Send>) {
        self.inner.canceled.store(false, Ordering::SeqCst);
        if self.inner.settled.load(Ordering::SeqCst) {
            confirm();
        } else {
            *self.inner.on_settle.lock() = Some(confirm);
        }
    }

    /// Suppress the destruction effect. The underlying event cannot be
    /// recalled, so settlement after this point is ignored.
    pub(crate) fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.on_settle.lock().take();
    }
}

/// Host-side handle settling an external TTL.
#[derive(Clone)]
pub struct TtlTrigger {
    inner: Arc<ExternalTtlInner>,
}

impl TtlTrigger {
    /// Signal that the external event occurred. Destroys the owning
    /// instance if it is still stale and the TTL was not canceled.
    pub fn settle(&self) {
        self.inner.settled.store(true, Ordering::SeqCst);
        if self.inner.canceled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(confirm) = self.inner.on_settle.lock().take() {
            confirm();
        }
    }
}

/// Static configuration attached to a template.
#[derive(Clone, Default)]
pub struct AtomConfig {
    /// TTL applied when an instance loses its last dependent. Falls back to
    /// the ecosystem default when absent.
    pub ttl: Option<Ttl>,
    /// Free-form tags used by dehydration filters.
    pub flags: Vec<String>,
    /// Transform applied to the state on dehydration.
    pub serialize: Option<StateTransform>,
    /// Inverse transform applied on hydration.
    pub deserialize: Option<StateTransform>,
}

struct TemplateInner {
    key: String,
    factory: Factory,
    config: AtomConfig,
}

/// The static description of an atom: key, factory, configuration.
#[derive(Clone)]
pub struct AtomTemplate {
    inner: Arc<TemplateInner>,
}

impl AtomTemplate {
    /// Create a template with default configuration.
    pub fn new<F>(key: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&mut EvalContext<'_>) -> Result<AtomValue> + Send + Sync + 'static,
    {
        Self::with_config(key, factory, AtomConfig::default())
    }

    /// Create a template with explicit configuration.
    pub fn with_config<F>(key: impl Into<String>, factory: F, config: AtomConfig) -> Self
    where
        F: Fn(&mut EvalContext<'_>) -> Result<AtomValue> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TemplateInner {
                key: key.into(),
                factory: Arc::new(factory),
                config,
            }),
        }
    }

    /// The template's key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The template's configuration.
    pub fn config(&self) -> &AtomConfig {
        &self.inner.config
    }

    pub(crate) fn factory(&self) -> &Factory {
        &self.inner.factory
    }
}

impl std::fmt::Debug for AtomTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomTemplate")
            .field("key", &self.inner.key)
            .field("flags", &self.inner.config.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn external_ttl_settle_after_arm_confirms() {
        let (ttl, trigger) = Ttl::external();
        let Ttl::External(external) = ttl else {
            panic!("expected external ttl");
        };

        let confirmed = Arc::new(AtomicUsize::new(0));
        let confirmed_clone = Arc::clone(&confirmed);
        external.arm(Box::new(move || {
            confirmed_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(confirmed.load(Ordering::SeqCst), 0);
        trigger.settle();
        assert_eq!(confirmed.load(Ordering::SeqCst), 1);

        // A second settle has nothing left to confirm.
        trigger.settle();
        assert_eq!(confirmed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn external_ttl_settle_before_arm_confirms_on_arm() {
        let (ttl, trigger) = Ttl::external();
        let Ttl::External(external) = ttl else {
            panic!("expected external ttl");
        };

        trigger.settle();

        let confirmed = Arc::new(AtomicUsize::new(0));
        let confirmed_clone = Arc::clone(&confirmed);
        external.arm(Box::new(move || {
            confirmed_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(confirmed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn canceled_external_ttl_ignores_settlement() {
        let (ttl, trigger) = Ttl::external();
        let Ttl::External(external) = ttl else {
            panic!("expected external ttl");
        };

        let confirmed = Arc::new(AtomicUsize::new(0));
        let confirmed_clone = Arc::clone(&confirmed);
        external.arm(Box::new(move || {
            confirmed_clone.fetch_add(1, Ordering::SeqCst);
        }));

        external.cancel();
        trigger.settle();
        assert_eq!(confirmed.load(Ordering::SeqCst), 0);
    }
}
