use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use segmux::{
    ContextConfig, DecisionEngine, EngineConfig, ExperimentId, ExperimentSpec, RawContext,
    StrategyConfig,
};
use std::hint::black_box;

const SOURCES: &[&str] = &["google", "instagram", "email", "facebook"];
const DEVICES: &[&str] = &["mobile", "desktop", "tablet"];

/// An active experiment with some history, so most requests resolve to a
/// powered segment rather than a root cold start.
fn warmed_engine(strategy: StrategyConfig, arms: usize) -> (DecisionEngine, ExperimentId) {
    let engine = DecisionEngine::new(EngineConfig::default()).unwrap();
    let variants: Vec<String> = (0..arms).map(|i| format!("v{i}")).collect();
    engine
        .register_experiment(
            ExperimentSpec::new("bench", variants)
                .with_context(ContextConfig::new(["source", "device"]))
                .with_strategy(strategy)
                .with_min_samples(20),
        )
        .unwrap();
    let id = ExperimentId::from("bench");
    engine.activate(&id).unwrap();

    for i in 0..4_000usize {
        let raw = raw(i);
        let a = engine.allocate(&id, &format!("warm-{i}"), &raw).unwrap();
        let reward = if i % 7 < 2 { 1.0 } else { 0.0 };
        engine.record_outcome(&a.decision_id, reward, None).unwrap();
    }
    (engine, id)
}

fn raw(i: usize) -> RawContext {
    RawContext::new()
        .with("source", SOURCES[i % SOURCES.len()])
        .with("device", DEVICES[(i / SOURCES.len()) % DEVICES.len()])
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");

    for strategy in ["thompson", "ucb", "epsilon_greedy", "adaptive"] {
        let cfg = StrategyConfig::named(strategy).unwrap();
        group.bench_with_input(BenchmarkId::new(strategy, 4), &4usize, |b, &arms| {
            let (engine, id) = warmed_engine(cfg, arms);
            let mut i = 0usize;
            b.iter(|| {
                i += 1;
                black_box(engine.allocate(&id, "visitor", &raw(i)).unwrap());
            })
        });
    }

    group.bench_function("allocate+outcome/thompson", |b| {
        let (engine, id) = warmed_engine(StrategyConfig::Thompson, 4);
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            let a = engine.allocate(&id, "visitor", &raw(i)).unwrap();
            black_box(engine.record_outcome(&a.decision_id, (i % 2) as f64, None).unwrap());
        })
    });

    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let (engine, id) = warmed_engine(StrategyConfig::Thompson, 3);
    c.bench_function("ledger/verify_full_chain", |b| {
        b.iter(|| black_box(engine.verify(&id, 1, u64::MAX).unwrap().is_valid))
    });
}

criterion_group!(benches, bench_allocate, bench_verify);
criterion_main!(benches);
