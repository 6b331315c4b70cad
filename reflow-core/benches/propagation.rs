//! Propagation benchmark: one source atom fanning out to many dynamic
//! dependents, re-evaluated per update inside a single flush.

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;

use reflow_core::{AtomTemplate, AtomValue, EcosystemConfig};

fn fanout_propagation(c: &mut Criterion) {
    let ecosystem = EcosystemConfig::new().id("bench").build();
    let source = AtomTemplate::new("source", |_ctx| Ok(AtomValue::Value(json!(0))));

    let readers: Vec<AtomTemplate> = (0..100)
        .map(|i| {
            let source = source.clone();
            AtomTemplate::new(format!("reader-{i}"), move |ctx| {
                let n = ctx.get(&source, &[])?.as_i64().unwrap_or(0);
                Ok(AtomValue::Value(json!(n + 1)))
            })
        })
        .collect();
    for reader in &readers {
        ecosystem.get(reader, &[]).unwrap();
    }

    let instance = ecosystem.get_instance(&source, &[]).unwrap();
    let mut n = 0_i64;

    c.bench_function("fanout-100", |b| {
        b.iter(|| {
            n += 1;
            instance.container().set_state(json!(n)).unwrap();
        })
    });
}

criterion_group!(benches, fanout_propagation);
criterion_main!(benches);
