//! Integration Tests for the Reactive Engine
//!
//! These tests exercise the graph, scheduler, instance lifecycle, and
//! derived-value cache together through the public ecosystem surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use reflow_core::{
    AtomConfig, AtomTemplate, AtomValue, EcosystemConfig, Error, InstanceStatus, ManualClock,
    NodeKey, PromiseStatus, Selector, Signal, SubscribeMode, Ttl,
};
use reflow_core::snapshot::{DehydrateOptions, HydrateOptions};

fn value_atom(key: &str, initial: Value) -> AtomTemplate {
    AtomTemplate::new(key, move |_ctx| Ok(AtomValue::Value(initial.clone())))
}

/// Weight invariant: every node's weight is 1 plus the sum of its
/// dependents' weights, where an external dependent counts as 1.
fn assert_weight_invariant(ecosystem: &reflow_core::Ecosystem) {
    let views = ecosystem.flat_view();
    let weights: std::collections::HashMap<NodeKey, u64> =
        views.iter().map(|v| (v.key.clone(), v.weight)).collect();

    for view in &views {
        let expected: u64 = 1
            + view
                .dependents
                .iter()
                .map(|d| weights.get(d).copied().unwrap_or(1))
                .sum::<u64>();
        assert_eq!(
            view.weight, expected,
            "weight invariant violated at {}",
            view.key
        );
    }
}

/// Test that the weight invariant holds through edge churn and destruction.
#[test]
fn weight_invariant_survives_edge_churn() {
    let ecosystem = EcosystemConfig::new().build();
    let a = value_atom("a", json!(1));
    let b = {
        let a = a.clone();
        AtomTemplate::new("b", move |ctx| {
            let n = ctx.get(&a, &[])?.as_i64().unwrap_or(0);
            Ok(AtomValue::Value(json!(n + 1)))
        })
    };
    let c = {
        let a = a.clone();
        let b = b.clone();
        AtomTemplate::new("c", move |ctx| {
            let x = ctx.get(&a, &[])?.as_i64().unwrap_or(0);
            let y = ctx.get(&b, &[])?.as_i64().unwrap_or(0);
            Ok(AtomValue::Value(json!(x + y)))
        })
    };

    ecosystem.get(&c, &[]).unwrap();
    let c_instance = ecosystem.get_instance(&c, &[]).unwrap();
    let _subscription = ecosystem.subscribe(&c_instance, SubscribeMode::Dynamic, |_, _| {});

    assert_weight_invariant(&ecosystem);

    // a is read by both b and c: weight(a) = 1 + weight(b) + weight(c).
    let views = ecosystem.flat_view();
    let weight_of = |key: &str| {
        views
            .iter()
            .find(|v| v.key.as_str() == key)
            .map(|v| v.weight)
            .unwrap()
    };
    assert_eq!(weight_of("c"), 2); // itself + one external dependent
    assert_eq!(weight_of("b"), 3);
    assert_eq!(weight_of("a"), 6);

    drop(_subscription);
    ecosystem.destroy_instance(&c_instance, true);
    assert_weight_invariant(&ecosystem);

    ecosystem.destroy();
}

/// Test that evaluation reasons batch: two source writes while the queue is
/// flushing produce exactly one dependent re-evaluation.
#[test]
fn accumulated_reasons_produce_one_evaluation() {
    let ecosystem = EcosystemConfig::new().build();
    let source = value_atom("source", json!(0));

    let evals = Arc::new(AtomicUsize::new(0));
    let reasons_seen = Arc::new(AtomicUsize::new(0));
    let reader = {
        let source = source.clone();
        let evals = Arc::clone(&evals);
        let reasons_seen = Arc::clone(&reasons_seen);
        AtomTemplate::new("reader", move |ctx| {
            evals.fetch_add(1, Ordering::SeqCst);
            reasons_seen.store(ctx.reasons().len(), Ordering::SeqCst);
            let n = ctx.get(&source, &[])?.as_i64().unwrap_or(0);
            Ok(AtomValue::Value(json!(n + 1)))
        })
    };

    ecosystem.get(&reader, &[]).unwrap();
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    // An atom whose deferred effect writes the source twice; both writes
    // land while the scheduler is still flushing, so the reader's reasons
    // accumulate into a single job.
    let writer = {
        let source = source.clone();
        AtomTemplate::new("writer", move |ctx| {
            let source = source.clone();
            let ecosystem = ctx.ecosystem().clone();
            ctx.effect(move || {
                let instance = ecosystem.get_instance(&source, &[]).unwrap();
                instance.container().set_state(json!(10)).unwrap();
                instance.container().set_state(json!(20)).unwrap();
                None
            });
            Ok(AtomValue::Value(Value::Null))
        })
    };
    ecosystem.get(&writer, &[]).unwrap();

    assert_eq!(evals.load(Ordering::SeqCst), 2);
    assert_eq!(reasons_seen.load(Ordering::SeqCst), 2);
    assert_eq!(*ecosystem.get(&reader, &[]).unwrap(), json!(21));

    ecosystem.destroy();
}

/// Test that a diamond (c reads a and b, b reads a) settles in one pass:
/// the heavier b evaluates first and c exactly once.
#[test]
fn diamond_settles_without_glitches() {
    let ecosystem = EcosystemConfig::new().build();
    let order = Arc::new(Mutex::new(Vec::new()));

    let a = value_atom("a", json!(1));
    let b = {
        let a = a.clone();
        let order = Arc::clone(&order);
        AtomTemplate::new("b", move |ctx| {
            order.lock().push("b");
            let n = ctx.get(&a, &[])?.as_i64().unwrap_or(0);
            Ok(AtomValue::Value(json!(n * 10)))
        })
    };
    let c = {
        let a = a.clone();
        let b = b.clone();
        let order = Arc::clone(&order);
        AtomTemplate::new("c", move |ctx| {
            order.lock().push("c");
            let x = ctx.get(&a, &[])?.as_i64().unwrap_or(0);
            let y = ctx.get(&b, &[])?.as_i64().unwrap_or(0);
            Ok(AtomValue::Value(json!(x + y)))
        })
    };

    ecosystem.get(&c, &[]).unwrap();
    order.lock().clear();

    let a_instance = ecosystem.get_instance(&a, &[]).unwrap();
    a_instance.container().set_state(json!(2)).unwrap();

    // b (weight 2) ran before c (weight 1), and c ran exactly once even
    // though both a and b changed under it.
    assert_eq!(*order.lock(), vec!["b", "c"]);
    assert_eq!(*ecosystem.get(&c, &[]).unwrap(), json!(22));

    ecosystem.destroy();
}

/// Test that static edges keep the dependency alive and visible without
/// ever re-evaluating the dependent.
#[test]
fn static_edges_never_trigger_evaluation() {
    let ecosystem = EcosystemConfig::new().build();
    let source = AtomTemplate::with_config(
        "source",
        |_ctx| Ok(AtomValue::Value(json!(0))),
        AtomConfig {
            ttl: Some(Ttl::Zero),
            ..Default::default()
        },
    );

    let evals = Arc::new(AtomicUsize::new(0));
    let holder = {
        let source = source.clone();
        let evals = Arc::clone(&evals);
        AtomTemplate::new("holder", move |ctx| {
            evals.fetch_add(1, Ordering::SeqCst);
            let _handle = ctx.get_instance(&source, &[])?;
            Ok(AtomValue::Value(Value::Null))
        })
    };

    ecosystem.get(&holder, &[]).unwrap();
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    let source_instance = ecosystem.get_instance(&source, &[]).unwrap();
    source_instance.container().set_state(json!(5)).unwrap();

    // No re-evaluation, but the statically-held source stays alive and in
    // the graph despite its zero TTL.
    assert_eq!(evals.load(Ordering::SeqCst), 1);
    assert_eq!(source_instance.status(), InstanceStatus::Active);
    let views = ecosystem.flat_view();
    let source_view = views.iter().find(|v| v.key.as_str() == "source").unwrap();
    assert_eq!(source_view.dependents, vec![NodeKey::new("holder")]);

    ecosystem.destroy();
}

/// Test that destruction is reachability-gated: zero TTL destroys
/// synchronously, a duration TTL waits for the timer and is canceled by a
/// re-attaching dependent.
#[test]
fn destruction_is_reachability_gated() {
    let clock = Arc::new(ManualClock::new());
    let ecosystem = EcosystemConfig::new().clock(clock.clone()).build();

    // Zero TTL: destroyed the moment the last dependent detaches.
    let ephemeral = AtomTemplate::with_config(
        "ephemeral",
        |_ctx| Ok(AtomValue::Value(json!(1))),
        AtomConfig {
            ttl: Some(Ttl::Zero),
            ..Default::default()
        },
    );
    let instance = ecosystem.get_instance(&ephemeral, &[]).unwrap();
    let subscription = ecosystem.subscribe(&instance, SubscribeMode::Dynamic, |_, _| {});
    subscription.unsubscribe();
    assert_eq!(instance.status(), InstanceStatus::Destroyed);

    // Duration TTL: survives until the timer fires...
    let lingering = AtomTemplate::with_config(
        "lingering",
        |_ctx| Ok(AtomValue::Value(json!(1))),
        AtomConfig {
            ttl: Some(Ttl::Millis(50)),
            ..Default::default()
        },
    );
    let instance = ecosystem.get_instance(&lingering, &[]).unwrap();
    let subscription = ecosystem.subscribe(&instance, SubscribeMode::Dynamic, |_, _| {});
    subscription.unsubscribe();
    assert_eq!(instance.status(), InstanceStatus::Stale);

    // ...unless a dependent re-attaches first, which cancels the timer.
    let subscription = ecosystem.subscribe(&instance, SubscribeMode::Dynamic, |_, _| {});
    assert_eq!(instance.status(), InstanceStatus::Active);
    clock.advance(Duration::from_millis(60));
    ecosystem.run_due_timers();
    assert_eq!(instance.status(), InstanceStatus::Active);

    // Detach again; this time the deadline passes unopposed.
    subscription.unsubscribe();
    assert_eq!(instance.status(), InstanceStatus::Stale);
    clock.advance(Duration::from_millis(60));
    ecosystem.run_due_timers();
    assert_eq!(instance.status(), InstanceStatus::Destroyed);

    ecosystem.destroy();
}

/// Test the external TTL: destruction on settlement, suppressed when a
/// dependent re-attaches before the trigger fires.
#[test]
fn external_ttl_destroys_on_settlement() {
    let ecosystem = EcosystemConfig::new().build();
    let (ttl, trigger) = Ttl::external();
    let atom = AtomTemplate::with_config(
        "promised",
        |_ctx| Ok(AtomValue::Value(json!(1))),
        AtomConfig {
            ttl: Some(ttl),
            ..Default::default()
        },
    );

    let instance = ecosystem.get_instance(&atom, &[]).unwrap();
    let subscription = ecosystem.subscribe(&instance, SubscribeMode::Dynamic, |_, _| {});
    subscription.unsubscribe();
    assert_eq!(instance.status(), InstanceStatus::Stale);

    // A dependent re-attaches; the in-flight settlement must be ignored.
    let subscription = ecosystem.subscribe(&instance, SubscribeMode::Dynamic, |_, _| {});
    assert_eq!(instance.status(), InstanceStatus::Active);
    trigger.settle();
    assert_eq!(instance.status(), InstanceStatus::Active);

    // The event has settled, so the next orphaning destroys immediately.
    subscription.unsubscribe();
    assert_eq!(instance.status(), InstanceStatus::Destroyed);

    ecosystem.destroy();
}

/// Test that `hydrate(dehydrate())` restores every included instance's
/// state, with the per-template transform applied and inverted.
#[test]
fn hydration_round_trips() {
    let ecosystem = EcosystemConfig::new().build();
    let persisted = AtomTemplate::with_config(
        "persisted",
        |_ctx| Ok(AtomValue::Value(json!(1))),
        AtomConfig {
            flags: vec!["persist".to_string()],
            serialize: Some(Arc::new(|v| json!({ "wrapped": v }))),
            deserialize: Some(Arc::new(|v| v.get("wrapped").cloned().unwrap_or(Value::Null))),
            ..Default::default()
        },
    );
    let transient = AtomTemplate::with_config(
        "transient",
        |_ctx| Ok(AtomValue::Value(json!(0))),
        AtomConfig {
            flags: vec!["transient".to_string()],
            ..Default::default()
        },
    );

    let instance = ecosystem.get_instance(&persisted, &[]).unwrap();
    instance.container().set_state(json!(5)).unwrap();
    ecosystem.get(&transient, &[]).unwrap();

    let snapshot = ecosystem.dehydrate(&DehydrateOptions::all().include_flags(["persist"]));
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get("persisted"), Some(&json!({ "wrapped": 5 })));

    // Drift the state, then restore it.
    instance.container().set_state(json!(999)).unwrap();
    ecosystem
        .hydrate(&snapshot, &HydrateOptions::default())
        .unwrap();
    assert_eq!(*instance.state(), json!(5));

    ecosystem.destroy();
}

/// Test that non-retroactive hydration only touches future instances.
#[test]
fn non_retroactive_hydration_stages_for_future_instances() {
    let ecosystem = EcosystemConfig::new().build();
    let counter = value_atom("counter", json!(0));

    let instance = ecosystem.get_instance(&counter, &[]).unwrap();
    instance.container().set_state(json!(3)).unwrap();

    let snapshot = ecosystem.dehydrate(&DehydrateOptions::all());
    instance.container().set_state(json!(4)).unwrap();

    // Live instance untouched without the retroactive flag.
    ecosystem
        .hydrate(&snapshot, &HydrateOptions { retroactive: false })
        .unwrap();
    assert_eq!(*instance.state(), json!(4));

    // A fresh ecosystem consumes the staged value at initialization.
    let fresh = EcosystemConfig::new().build();
    fresh
        .hydrate(&snapshot, &HydrateOptions { retroactive: false })
        .unwrap();
    assert_eq!(*fresh.get(&counter, &[]).unwrap(), json!(3));

    fresh.destroy();
    ecosystem.destroy();
}

/// Test ghost materialization: buffered updates replay once; a destroyed
/// ghost delivers nothing and materializing it afterwards is a no-op.
#[test]
fn ghost_edges_buffer_until_materialized() {
    let ecosystem = EcosystemConfig::new().build();
    let atom = value_atom("ghosted", json!(0));
    let instance = ecosystem.get_instance(&atom, &[]).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(Mutex::new(Value::Null));
    let ghost = {
        let calls = Arc::clone(&calls);
        let last = Arc::clone(&last);
        ecosystem.ghost_subscribe(&instance, SubscribeMode::Dynamic, move |_signal, value| {
            calls.fetch_add(1, Ordering::SeqCst);
            *last.lock() = value.as_ref().clone();
        })
    };

    instance.container().set_state(json!(1)).unwrap();
    instance.container().set_state(json!(2)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Materializing replays only the latest buffered call, exactly once.
    ghost.materialize();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*last.lock(), json!(2));

    // Confirmed subscribers forward directly.
    instance.container().set_state(json!(3)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*last.lock(), json!(3));

    // A discarded ghost delivers nothing, ever.
    let dead_calls = Arc::new(AtomicUsize::new(0));
    let dead = {
        let dead_calls = Arc::clone(&dead_calls);
        ecosystem.ghost_subscribe(&instance, SubscribeMode::Dynamic, move |_signal, _value| {
            dead_calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    instance.container().set_state(json!(4)).unwrap();
    dead.destroy();
    dead.materialize(); // logged no-op, not a panic
    assert_eq!(dead_calls.load(Ordering::SeqCst), 0);

    ecosystem.destroy();
}

/// Test that async-flagged subscribers are notified after synchronous ones
/// within the same flush, regardless of registration order.
#[test]
fn async_subscribers_run_after_synchronous_ones() {
    let ecosystem = EcosystemConfig::new().build();
    let atom = value_atom("prioritized", json!(0));
    let instance = ecosystem.get_instance(&atom, &[]).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));

    // Registered first, but async: it should still run last.
    let order_async = Arc::clone(&order);
    let _async_subscription =
        ecosystem.subscribe_async(&instance, SubscribeMode::Dynamic, move |_, _| {
            order_async.lock().push("async");
        });
    let order_sync = Arc::clone(&order);
    let _sync_subscription =
        ecosystem.subscribe(&instance, SubscribeMode::Dynamic, move |_, _| {
            order_sync.lock().push("sync");
        });

    instance.container().set_state(json!(1)).unwrap();

    assert_eq!(*order.lock(), vec!["sync", "async"]);
    ecosystem.destroy();
}

/// Test that external subscribers hear about updates after the state has
/// settled, and get a final Destroyed signal.
#[test]
fn external_subscribers_observe_updates_and_destruction() {
    let ecosystem = EcosystemConfig::new().build();
    let atom = value_atom("observed", json!(0));
    let instance = ecosystem.get_instance(&atom, &[]).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let _subscription = ecosystem.subscribe(&instance, SubscribeMode::Dynamic, move |signal, value| {
        seen_clone.lock().push((signal, value.as_ref().clone()));
    });

    instance.container().set_state(json!(1)).unwrap();
    ecosystem.destroy_instance(&instance, true);

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (Signal::Updated, json!(1)));
    assert_eq!(seen[1], (Signal::Destroyed, json!(1)));

    ecosystem.destroy();
}

/// Test that a failing factory still runs the cleanups its partial
/// evaluation registered, then surfaces the error.
#[test]
fn evaluation_errors_run_partial_cleanups() {
    let ecosystem = EcosystemConfig::new().build();
    let cleaned = Arc::new(AtomicUsize::new(0));
    let broken = {
        let cleaned = Arc::clone(&cleaned);
        AtomTemplate::new("broken", move |ctx| {
            let cleaned = Arc::clone(&cleaned);
            ctx.on_cleanup(move || {
                cleaned.fetch_add(1, Ordering::SeqCst);
            });
            Err(Error::evaluation("broken", "injector exploded"))
        })
    };

    let result = ecosystem.get(&broken, &[]);
    assert!(matches!(result, Err(Error::Evaluation { .. })));
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);

    ecosystem.destroy();
}

/// Test that returning a different backing kind on re-evaluation is fatal
/// for the instance.
#[test]
fn backing_kind_changes_are_fatal() {
    let ecosystem = EcosystemConfig::new().build();
    let flip = Arc::new(AtomicUsize::new(0));
    let unstable = {
        let flip = Arc::clone(&flip);
        AtomTemplate::new("unstable", move |_ctx| {
            if flip.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(AtomValue::Value(json!(0)))
            } else {
                Ok(AtomValue::Container(reflow_core::Container::new("rogue")))
            }
        })
    };

    let instance = ecosystem.get_instance(&unstable, &[]).unwrap();
    assert_eq!(instance.status(), InstanceStatus::Active);

    // The re-evaluation returns a container where a value was established.
    ecosystem.invalidate(&instance);
    assert_eq!(instance.status(), InstanceStatus::Destroyed);

    ecosystem.destroy();
}

/// Test promise forwarding: a rejection becomes the instance's error state,
/// surfaced on read rather than thrown during propagation.
#[test]
fn promise_rejections_surface_as_error_state() {
    let ecosystem = EcosystemConfig::new().build();
    let atom = value_atom("async", json!(null));
    let instance = ecosystem.get_instance(&atom, &[]).unwrap();

    assert_eq!(instance.promise_status(), PromiseStatus::None);

    instance.set_promise_pending();
    assert_eq!(instance.promise_status(), PromiseStatus::Pending);

    instance.reject_promise("network down");
    assert_eq!(instance.promise_status(), PromiseStatus::Rejected);
    assert!(matches!(
        instance.promise_error(),
        Some(Error::PromiseRejected { .. })
    ));

    // Reading the instance still works; the error is a parallel channel.
    assert_eq!(*instance.state(), json!(null));

    ecosystem.destroy();
}

/// Test that explicit invalidation re-evaluates with a cache-invalidated
/// reason.
#[test]
fn invalidate_forces_a_reevaluation() {
    let ecosystem = EcosystemConfig::new().build();
    let evals = Arc::new(AtomicUsize::new(0));
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let atom = {
        let evals = Arc::clone(&evals);
        let kinds = Arc::clone(&kinds);
        AtomTemplate::new("invalidated", move |ctx| {
            evals.fetch_add(1, Ordering::SeqCst);
            kinds
                .lock()
                .extend(ctx.reasons().iter().map(|r| r.kind));
            Ok(AtomValue::Value(json!(evals.load(Ordering::SeqCst))))
        })
    };

    let instance = ecosystem.get_instance(&atom, &[]).unwrap();
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    ecosystem.invalidate(&instance);
    assert_eq!(evals.load(Ordering::SeqCst), 2);
    assert_eq!(*kinds.lock(), vec![reflow_core::ReasonKind::CacheInvalidated]);
    assert_eq!(*instance.state(), json!(2));

    ecosystem.destroy();
}

/// Test the derived-value cache: selectors recompute on dependency change
/// and the comparator suppresses downstream propagation.
#[test]
fn selectors_cache_and_suppress_unchanged_results() {
    let ecosystem = EcosystemConfig::new().build();
    let source = value_atom("numbers", json!([1, 5, 3]));

    let computes = Arc::new(AtomicUsize::new(0));
    let max = {
        let source = source.clone();
        let computes = Arc::clone(&computes);
        Selector::new("max", move |ctx, _args| {
            computes.fetch_add(1, Ordering::SeqCst);
            let numbers = ctx.get(&source, &[])?;
            let max = numbers
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_i64).max().unwrap_or(0))
                .unwrap_or(0);
            Ok(json!(max))
        })
    };

    let evals = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let max = max.clone();
        let evals = Arc::clone(&evals);
        AtomTemplate::new("consumer", move |ctx| {
            evals.fetch_add(1, Ordering::SeqCst);
            let value = ctx.select(&max, &[])?;
            Ok(AtomValue::Value(value.as_ref().clone()))
        })
    };

    assert_eq!(*ecosystem.get(&consumer, &[]).unwrap(), json!(5));
    assert_eq!(computes.load(Ordering::SeqCst), 1);
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    let source_instance = ecosystem.get_instance(&source, &[]).unwrap();

    // The maximum is unchanged: the selector recomputes but the consumer
    // does not re-evaluate.
    source_instance
        .container()
        .set_state(json!([1, 5, 2]))
        .unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 2);
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    // The maximum changes: propagation resumes.
    source_instance
        .container()
        .set_state(json!([9, 5, 2]))
        .unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 3);
    assert_eq!(evals.load(Ordering::SeqCst), 2);
    assert_eq!(*ecosystem.get(&consumer, &[]).unwrap(), json!(9));

    ecosystem.destroy();
}

/// Test the inspection views over a small graph.
#[test]
fn graph_views_reflect_the_dependency_structure() {
    let ecosystem = EcosystemConfig::new().build();
    let a = value_atom("view-a", json!(0));
    let b = {
        let a = a.clone();
        AtomTemplate::new("view-b", move |ctx| {
            let n = ctx.get(&a, &[])?.as_i64().unwrap_or(0);
            Ok(AtomValue::Value(json!(n)))
        })
    };

    ecosystem.get(&b, &[]).unwrap();

    let flat = ecosystem.flat_view();
    assert_eq!(flat.len(), 2);

    let top_down = ecosystem.top_down_view();
    assert_eq!(top_down.len(), 1);
    assert_eq!(top_down[0].key.as_str(), "view-a");
    assert_eq!(top_down[0].children[0].key.as_str(), "view-b");

    let bottom_up = ecosystem.bottom_up_view();
    assert_eq!(bottom_up.len(), 1);
    assert_eq!(bottom_up[0].key.as_str(), "view-b");
    assert_eq!(bottom_up[0].children[0].key.as_str(), "view-a");

    ecosystem.destroy();
}

/// Test that destroying a dependent cascades destruction to dependencies
/// that become unreachable, per their TTLs.
#[test]
fn orphaned_dependencies_cascade_per_ttl() {
    let ecosystem = EcosystemConfig::new().build();
    let leaf = AtomTemplate::with_config(
        "cascade-leaf",
        |_ctx| Ok(AtomValue::Value(json!(1))),
        AtomConfig {
            ttl: Some(Ttl::Zero),
            ..Default::default()
        },
    );
    let root = {
        let leaf = leaf.clone();
        AtomTemplate::new("cascade-root", move |ctx| {
            let n = ctx.get(&leaf, &[])?.as_i64().unwrap_or(0);
            Ok(AtomValue::Value(json!(n)))
        })
    };

    ecosystem.get(&root, &[]).unwrap();
    let leaf_instance = ecosystem.get_instance(&leaf, &[]).unwrap();
    let root_instance = ecosystem.get_instance(&root, &[]).unwrap();

    ecosystem.destroy_instance(&root_instance, true);

    // The leaf lost its only dependent; its zero TTL destroyed it too.
    assert_eq!(leaf_instance.status(), InstanceStatus::Destroyed);
    assert!(ecosystem.flat_view().is_empty());

    ecosystem.destroy();
}
