//! Shared-engine behavior under concurrent workers.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::Duration;
use segmux::{
    AllocationNote, ContextConfig, DecisionEngine, EngineConfig, ExperimentId, ExperimentSpec,
    LedgerEntry, LedgerSink, ManualClock, PosteriorStore, PruneConfig, RawContext, SegmentKey,
    StateKey, StrategyKind, UpdatePolicy, VariantId,
};

const WORKERS: usize = 8;

fn shared_engine(variants: &[&str]) -> (Arc<DecisionEngine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let engine = DecisionEngine::new(EngineConfig::default())
        .unwrap()
        .with_clock(clock.clone());
    for name in ["alpha", "beta"] {
        engine
            .register_experiment(
                ExperimentSpec::new(name, variants.iter().copied())
                    .with_context(ContextConfig::new(["source"]))
                    .with_min_samples(10),
            )
            .unwrap();
        engine.activate(&ExperimentId::from(name)).unwrap();
    }
    (Arc::new(engine), clock)
}

#[test]
fn engine_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<DecisionEngine>();
    assert_send_sync::<PosteriorStore>();
}

#[test]
fn concurrent_allocations_keep_a_gapless_chain() {
    let (engine, _) = shared_engine(&["a", "b", "c"]);
    const PER_WORKER: usize = 200;

    thread::scope(|s| {
        for w in 0..WORKERS {
            let engine = Arc::clone(&engine);
            s.spawn(move || {
                let exp = ExperimentId::from(if w % 2 == 0 { "alpha" } else { "beta" });
                let raw = RawContext::new().with("source", if w % 3 == 0 { "google" } else { "email" });
                for i in 0..PER_WORKER {
                    engine.allocate(&exp, &format!("w{w}-{i}"), &raw).unwrap();
                }
            });
        }
    });

    for name in ["alpha", "beta"] {
        let id = ExperimentId::from(name);
        let export = engine.export_ledger(&id).unwrap();
        let expected = (WORKERS / 2 * PER_WORKER) as u64;
        assert_eq!(export.decisions, expected);
        let report = engine.verify(&id, 1, expected).unwrap();
        assert!(report.is_valid, "{:?}", report.first_violation());
        let visits: u64 = engine.variant_report(&id).unwrap().iter().map(|v| v.visits).sum();
        assert_eq!(visits, expected);
        let root = engine
            .segment_report(&id)
            .unwrap()
            .into_iter()
            .find(|s| s.key.is_root())
            .unwrap();
        assert_eq!(root.total_visits, expected);
    }
}

#[test]
fn concurrent_outcomes_on_one_key_lose_nothing() {
    let (engine, clock) = shared_engine(&["only"]);
    let id = ExperimentId::from("alpha");
    let raw = RawContext::new().with("source", "google");
    const N: usize = 400;

    let decisions: Vec<_> = (0..N)
        .map(|i| engine.allocate(&id, &format!("v{i}"), &raw).unwrap().decision_id)
        .collect();
    clock.advance(Duration::seconds(1));

    thread::scope(|s| {
        for chunk in decisions.chunks(N / WORKERS) {
            let engine = Arc::clone(&engine);
            s.spawn(move || {
                for (i, d) in chunk.iter().enumerate() {
                    let ack = engine.record_outcome(d, (i % 2) as f64, None).unwrap();
                    assert!(ack.accepted);
                }
            });
        }
    });

    let table = engine.posterior_report(&id).unwrap();
    let only = VariantId::from("only");
    assert_eq!(table[&SegmentKey::root()][&only].samples, N as u64);
    assert_eq!(
        table[&SegmentKey::parse("source:google").unwrap()][&only].samples,
        N as u64
    );
    let export = engine.export_ledger(&id).unwrap();
    assert_eq!(export.outcomes, N as u64);
    assert!(export.verify().is_valid);
}

#[test]
fn racing_duplicate_outcomes_count_once() {
    let (engine, clock) = shared_engine(&["a", "b"]);
    let id = ExperimentId::from("beta");
    let d = engine.allocate(&id, "v", &RawContext::new()).unwrap().decision_id;
    clock.advance(Duration::seconds(1));

    let accepted: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let d = d.clone();
                s.spawn(move || engine.record_outcome(&d, 1.0, None).unwrap().accepted as usize)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert_eq!(accepted, 1);
    let samples: u64 = engine
        .posterior_report(&id)
        .unwrap()
        .get(&SegmentKey::root())
        .map(|row| row.values().map(|s| s.samples).sum())
        .unwrap_or(0);
    assert_eq!(samples, 1);
}

#[test]
fn store_updates_are_linearizable_per_key() {
    let store = Arc::new(PosteriorStore::new(UpdatePolicy {
        attempts: 1_000,
        lock_timeout: StdDuration::from_millis(10),
    }));
    let exp = ExperimentId::from("e");
    let chain = vec![SegmentKey::parse("device:mobile").unwrap(), SegmentKey::root()];
    let v = VariantId::from("a");
    const PER_WORKER: usize = 500;

    thread::scope(|s| {
        for w in 0..WORKERS {
            let store = Arc::clone(&store);
            let (exp, chain, v) = (exp.clone(), chain.clone(), v.clone());
            s.spawn(move || {
                for i in 0..PER_WORKER {
                    let reward = if (w + i) % 4 == 0 { 1.0 } else { 0.0 };
                    store.update_chain(&exp, &chain, &v, reward).unwrap();
                }
            });
        }
    });

    let total = (WORKERS * PER_WORKER) as u64;
    let wins = (0..WORKERS)
        .flat_map(|w| (0..PER_WORKER).map(move |i| (w + i) % 4 == 0))
        .filter(|x| *x)
        .count() as f64;
    for seg in &chain {
        let p = store.get(&StateKey::new(&exp, seg, &v));
        assert_eq!(p.samples, total);
        assert_eq!(p.alpha - 1.0, wins);
        assert_eq!(p.beta - 1.0, total as f64 - wins);
    }
}

#[test]
fn maintenance_runs_beside_traffic() {
    let clock = Arc::new(ManualClock::default());
    let config = EngineConfig {
        prune: PruneConfig {
            retention: StdDuration::from_secs(60),
            min_visits: 1_000_000,
        },
        ..EngineConfig::default()
    };
    let engine = Arc::new(
        DecisionEngine::new(config)
            .unwrap()
            .with_clock(clock.clone()),
    );
    engine
        .register_experiment(
            ExperimentSpec::new("m", ["a", "b"]).with_context(ContextConfig::new(["source"])),
        )
        .unwrap();
    let id = ExperimentId::from("m");
    engine.activate(&id).unwrap();
    engine
        .allocate(&id, "first", &RawContext::new().with("source", "bing"))
        .unwrap();
    clock.advance(Duration::minutes(5));

    let handle = engine.spawn_maintenance(StdDuration::from_millis(5)).unwrap();
    for i in 0..200 {
        engine
            .allocate(&id, &format!("v{i}"), &RawContext::new().with("source", "bing"))
            .unwrap();
    }
    let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
    let bing = SegmentKey::parse("source:bing").unwrap();
    loop {
        let pruned = engine
            .segment_report(&id)
            .unwrap()
            .iter()
            .any(|s| s.key == bing && s.pruned);
        if pruned {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "maintenance never pruned");
        thread::sleep(StdDuration::from_millis(5));
    }
    handle.stop();
    assert!(engine.verify(&id, 1, 201).unwrap().is_valid);
}

/// Sink whose outcome writes stall, like a slow fsync.
#[derive(Debug, Default)]
struct StallingSink {
    stall: bool,
    in_flight: AtomicBool,
}

impl LedgerSink for StallingSink {
    fn append(&self, entry: &LedgerEntry) -> io::Result<()> {
        if self.stall && matches!(entry, LedgerEntry::Outcome(_)) {
            self.in_flight.store(true, Ordering::Release);
            thread::sleep(StdDuration::from_millis(150));
        }
        Ok(())
    }
}

#[test]
fn slow_outcome_write_does_not_starve_allocation() {
    let clock = Arc::new(ManualClock::default());
    let sink = Arc::new(StallingSink {
        stall: true,
        ..StallingSink::default()
    });
    let deadline = StdDuration::from_millis(20);
    let engine = Arc::new(
        DecisionEngine::new(EngineConfig {
            allocation_deadline: deadline,
            ..EngineConfig::default()
        })
        .unwrap()
        .with_clock(clock.clone())
        .with_sink(sink.clone()),
    );
    let id = ExperimentId::from("slow");
    engine
        .register_experiment(
            ExperimentSpec::new("slow", ["only"]).with_context(ContextConfig::new(["source"])),
        )
        .unwrap();
    engine.activate(&id).unwrap();
    let raw = RawContext::new().with("source", "google");
    let first = engine.allocate(&id, "v1", &raw).unwrap().decision_id;
    let second = engine.allocate(&id, "v2", &raw).unwrap().decision_id;
    clock.advance(Duration::seconds(1));
    // Materialize the cells the next allocation reads.
    engine.record_outcome(&first, 1.0, None).unwrap();
    sink.in_flight.store(false, Ordering::Release);

    let allocation = thread::scope(|s| {
        let writer = {
            let engine = Arc::clone(&engine);
            let second = second.clone();
            s.spawn(move || engine.record_outcome(&second, 1.0, None).unwrap())
        };
        while !sink.in_flight.load(Ordering::Acquire) {
            thread::yield_now();
        }
        let a = engine.allocate(&id, "v3", &raw).unwrap();
        assert!(writer.join().unwrap().accepted);
        a
    });

    assert!(
        !allocation.notes.contains(&AllocationNote::DeadlineFallback),
        "{:?}",
        allocation.notes
    );
    let thompson = engine
        .strategy_benchmark()
        .into_iter()
        .find(|b| b.strategy == StrategyKind::Thompson)
        .unwrap();
    assert!(thompson.mean_selection_latency < deadline);

    let export = engine.export_ledger(&id).unwrap();
    assert!(export.verify().is_valid);
    let position = |pred: &dyn Fn(&LedgerEntry) -> bool| export.entries.iter().position(pred).unwrap();
    let outcome = position(&|e| matches!(e, LedgerEntry::Outcome(o) if o.decision_sequence_no == 2));
    let decision = position(&|e| matches!(e, LedgerEntry::Decision(d) if d.sequence_no == 3));
    assert!(outcome < decision);
    let root = &engine.posterior_report(&id).unwrap()[&SegmentKey::root()][&VariantId::from("only")];
    assert_eq!(root.samples, 2);
}
