//! The decision engine: allocation, outcomes, reporting, persistence.
//!
//! [`DecisionEngine`] is `Send + Sync` and every operation takes `&self`, so a
//! pool of worker threads can share one engine behind an `Arc`.
//!
//! Allocation path:
//! 1. normalize the raw context and derive the visitor's cascade chain,
//! 2. resolve the most specific powered segment (or root),
//! 3. select a variant with the experiment's strategy,
//! 4. append the Decision Record to the ledger,
//! 5. only then bump visit counters and return.
//!
//! Outcome path: under the experiment's ledger lock, validate the outcome and
//! append the Outcome Record. Only once it is durable are the variant's
//! posteriors along the decision's chain write-locked and updated, so a slow
//! sink never holds a lock that allocation reads through. A failed append
//! leaves both the ledger and the posteriors untouched.
//!
//! Snapshot restore and ledger replay check their whole input before
//! installing any of it; a rejected input leaves the engine as it was.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::posterior::check_reward;
use crate::stable_hash::decision_rng;
use crate::{
    cascade_chain, lift, resolve_context, Allocation, AllocationNote, AllocationStrategy,
    AuditLedger, BetaPosterior, Clock, DecisionDraft, DecisionId, Error, Experiment, ExperimentId,
    ExperimentSpec, ExperimentStatus, FlaggedRange, LedgerEntry, LedgerExport, LedgerSink,
    LiftConfig, LiftFinding, OutcomeCheck, OutcomeDraft, PosteriorStore, PosteriorTable,
    PruneConfig, PruneReport, RawContext, Result, SegmentHierarchy, SegmentKey, SegmentView,
    StateKey, StrategyBenchmark, StrategyConfig, StrategyRegistry, SystemClock, UpdatePolicy,
    VariantId, VariantView, VerificationReport,
};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root seed for per-decision random streams.
    pub seed: u64,
    /// Budget for reading posterior snapshots before falling back to a
    /// uniform choice at root.
    #[serde(rename = "allocation_deadline_ms", with = "crate::clock::millis")]
    pub allocation_deadline: Duration,
    /// Write-lock attempts per posterior before an update reports contention.
    pub update_attempts: u32,
    #[serde(rename = "update_lock_timeout_ms", with = "crate::clock::millis")]
    pub update_lock_timeout: Duration,
    pub prune: PruneConfig,
    /// Significance level for lift reports.
    pub lift_alpha: f64,
    pub lift_top_n: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let update = UpdatePolicy::default();
        let lift = LiftConfig::default();
        Self {
            seed: 0x5eed_0f_5e9_u64,
            allocation_deadline: Duration::from_millis(50),
            update_attempts: update.attempts,
            update_lock_timeout: update.lock_timeout,
            prune: PruneConfig::default(),
            lift_alpha: lift.alpha,
            lift_top_n: lift.top_n,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: EngineConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allocation_deadline.is_zero() {
            return Err(Error::InvalidConfig("allocation_deadline must be positive".into()));
        }
        if self.update_attempts == 0 {
            return Err(Error::InvalidConfig("update_attempts must be >= 1".into()));
        }
        if !(self.lift_alpha > 0.0 && self.lift_alpha < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "lift_alpha must be in (0, 1), got {}",
                self.lift_alpha
            )));
        }
        if self.prune.retention.is_zero() {
            return Err(Error::InvalidConfig("prune.retention must be positive".into()));
        }
        Ok(())
    }

    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            attempts: self.update_attempts,
            lock_timeout: self.update_lock_timeout,
        }
    }
}

/// Reply to [`DecisionEngine::record_outcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeAck {
    pub decision_id: DecisionId,
    /// `false` when the decision already had an outcome; nothing was written.
    pub accepted: bool,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Counts from [`DecisionEngine::replay_ledger`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub decisions: u64,
    pub outcomes: u64,
}

// ---------------------------------------------------------------------------
// Snapshots

/// One variant-segment posterior, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub segment: SegmentKey,
    pub variant: VariantId,
    pub posterior: BetaPosterior,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub spec: ExperimentSpec,
    pub status: ExperimentStatus,
    pub variants: Vec<VariantView>,
    pub segments: Vec<SegmentView>,
    pub states: Vec<StateSnapshot>,
    pub ledger: Vec<LedgerEntry>,
}

/// Serializable engine state. Taken per experiment without a global pause,
/// so under live traffic the posteriors may trail the ledger by in-flight
/// requests; quiesce writers first for an exact copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub nonce: u64,
    pub experiments: Vec<ExperimentSnapshot>,
}

impl EngineSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

// ---------------------------------------------------------------------------
// Engine

#[derive(Debug)]
pub struct DecisionEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    experiments: DashMap<ExperimentId, Arc<Experiment>>,
    hierarchy: SegmentHierarchy,
    store: PosteriorStore,
    ledger: AuditLedger,
    strategies: StrategyRegistry,
    nonce: AtomicU64,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: PosteriorStore::new(config.update_policy()),
            config,
            clock: Arc::new(SystemClock),
            experiments: DashMap::new(),
            hierarchy: SegmentHierarchy::new(),
            ledger: AuditLedger::default(),
            strategies: StrategyRegistry::new(),
            nonce: AtomicU64::new(0),
        })
    }

    /// Replace the clock. Intended for construction time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the ledger sink. Must be called before anything is recorded;
    /// the in-memory chains are reset.
    pub fn with_sink(mut self, sink: Arc<dyn LedgerSink>) -> Self {
        self.ledger = AuditLedger::new(sink);
        self
    }

    /// Rebuild an engine from a snapshot. Ledger chains are re-verified.
    pub fn from_snapshot(config: EngineConfig, snapshot: EngineSnapshot) -> Result<Self> {
        let engine = Self::new(config)?;
        engine.restore_snapshot(snapshot)?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn experiment(&self, id: &ExperimentId) -> Result<Arc<Experiment>> {
        self.experiments
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::UnknownExperiment(id.clone()))
    }

    /// Registered experiment ids, sorted.
    pub fn experiment_ids(&self) -> Vec<ExperimentId> {
        let mut ids: Vec<ExperimentId> = self.experiments.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn status(&self, id: &ExperimentId) -> Result<ExperimentStatus> {
        Ok(self.experiment(id)?.status())
    }

    // --- lifecycle ---------------------------------------------------------

    /// Register an experiment in `draft`.
    pub fn register_experiment(&self, spec: ExperimentSpec) -> Result<()> {
        let exp = Experiment::new(spec)?;
        let id = exp.id().clone();
        match self.experiments.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::DuplicateExperiment { experiment: id })
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                self.strategies.assign(&id, exp.spec().strategy)?;
                tracing::info!(
                    experiment = %id,
                    variants = exp.variants().len(),
                    strategy = %exp.spec().strategy.kind(),
                    min_samples = exp.spec().min_samples_threshold,
                    "experiment registered"
                );
                v.insert(Arc::new(exp));
            }
        }
        Ok(())
    }

    /// Move an experiment along its status machine; returns the previous status.
    pub fn transition(&self, id: &ExperimentId, to: ExperimentStatus) -> Result<ExperimentStatus> {
        let from = self.experiment(id)?.transition(to)?;
        tracing::info!(experiment = %id, %from, %to, "experiment status changed");
        Ok(from)
    }

    pub fn activate(&self, id: &ExperimentId) -> Result<ExperimentStatus> {
        self.transition(id, ExperimentStatus::Active)
    }

    pub fn archive(&self, id: &ExperimentId) -> Result<ExperimentStatus> {
        self.transition(id, ExperimentStatus::Archived)
    }

    /// Switch the allocation strategy of a registered experiment.
    pub fn set_strategy(&self, id: &ExperimentId, strategy: StrategyConfig) -> Result<()> {
        self.experiment(id)?;
        self.strategies.assign(id, strategy)?;
        tracing::info!(experiment = %id, strategy = %strategy.kind(), "strategy changed");
        Ok(())
    }

    pub fn strategy(&self, id: &ExperimentId) -> Result<StrategyConfig> {
        let exp = self.experiment(id)?;
        Ok(self.strategies.get(id).unwrap_or(exp.spec().strategy))
    }

    // --- allocation --------------------------------------------------------

    /// Choose a variant for `visitor_id`. The Decision Record is durable
    /// before this returns. Sparse data never fails an allocation.
    pub fn allocate(
        &self,
        experiment_id: &ExperimentId,
        visitor_id: &str,
        raw: &RawContext,
    ) -> Result<Allocation> {
        let exp = self.experiment(experiment_id)?;
        exp.ensure_active()?;
        if visitor_id.is_empty() {
            return Err(Error::MalformedContext("visitor id must not be empty".into()));
        }

        let now = self.clock.now();
        let features = if raw.timestamp.is_some() {
            resolve_context(raw, &exp.spec().context)?
        } else {
            resolve_context(&raw.clone().at(now), &exp.spec().context)?
        };
        let drop_order = exp.spec().context.effective_drop_order();
        let chain = cascade_chain(&features, &drop_order);
        let context_key = chain.first().cloned().unwrap_or_else(SegmentKey::root);
        let strategy = self.strategies.get(experiment_id).unwrap_or(exp.spec().strategy);
        let variants = exp.variants();

        let started = Instant::now();
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let mut rng = decision_rng(self.config.seed, nonce, experiment_id.as_str(), visitor_id);
        let resolution = self.hierarchy.resolve(
            &self.store,
            experiment_id,
            &chain,
            variants,
            exp.spec().min_samples_threshold,
            started + self.config.allocation_deadline,
        );

        let mut notes = Vec::with_capacity(2);
        let (segment, index) = match resolution {
            None => {
                tracing::warn!(
                    experiment = %experiment_id,
                    deadline_ms = self.config.allocation_deadline.as_millis() as u64,
                    "posterior snapshot missed deadline; uniform fallback at root"
                );
                notes.push(AllocationNote::DeadlineFallback);
                (SegmentKey::root(), rng.random_range(0..variants.len()))
            }
            Some(r) => {
                if r.is_root() {
                    let skipped_pruned = chain
                        .iter()
                        .filter(|k| self.hierarchy.is_pruned(experiment_id, k))
                        .count();
                    notes.push(AllocationNote::RootFallback { skipped_pruned });
                } else {
                    notes.push(AllocationNote::CascadeResolved { level: r.level });
                }
                let index = if variants.len() == 1 {
                    notes.push(AllocationNote::SingleVariant);
                    0
                } else if r.is_root() && r.posteriors.iter().any(|p| p.samples == 0) {
                    notes.push(AllocationNote::UniformColdStart);
                    rng.random_range(0..variants.len())
                } else {
                    match strategy.select(&r.posteriors, &mut rng) {
                        Some(pick) => {
                            notes.push(pick.note);
                            pick.index
                        }
                        None => 0,
                    }
                };
                (r.segment, index)
            }
        };
        self.strategies.record_selection(strategy.kind(), started.elapsed());

        let variant_id = variants[index].clone();
        let record = self.ledger.append_decision(DecisionDraft {
            experiment_id: experiment_id.clone(),
            visitor_id: visitor_id.to_string(),
            variant_id: variant_id.clone(),
            segment_key_resolved: segment.clone(),
            context_key: context_key.clone(),
            strategy: strategy.kind(),
            decision_timestamp: now,
        })?;

        exp.record_visit(index);
        self.hierarchy.observe_visit(experiment_id, &chain, now);

        tracing::debug!(
            experiment = %experiment_id,
            sequence_no = record.sequence_no,
            segment = %segment,
            variant = %variant_id,
            "allocated"
        );

        Ok(Allocation {
            decision_id: DecisionId::new(experiment_id.clone(), record.sequence_no),
            variant_id,
            segment_key: segment,
            context_key,
            strategy: strategy.kind(),
            decided_at: now,
            notes,
        })
    }

    // --- outcomes ----------------------------------------------------------

    /// Record the outcome of a decision. A second outcome for the same
    /// decision is acknowledged with `accepted: false` and changes nothing.
    pub fn record_outcome(
        &self,
        decision_id: &DecisionId,
        reward: f64,
        conversion_value: Option<f64>,
    ) -> Result<OutcomeAck> {
        let experiment_id = &decision_id.experiment_id;
        let exp = self.experiment(experiment_id)?;
        match exp.status() {
            ExperimentStatus::Draft | ExperimentStatus::Archived => {
                return Err(Error::ExperimentNotActive {
                    experiment: experiment_id.clone(),
                    status: exp.status(),
                })
            }
            _ => {}
        }
        let reward = check_reward(reward)?;
        if let Some(v) = conversion_value.filter(|v| !v.is_finite()) {
            return Err(Error::InvalidReward(v));
        }

        let now = self.clock.now();
        let draft = OutcomeDraft {
            experiment_id: experiment_id.clone(),
            decision_sequence_no: decision_id.sequence_no,
            conversion_timestamp: now,
            reward,
            conversion_value,
        };
        let drop_order = exp.spec().context.effective_drop_order();

        let applied = self.ledger.with_writer(experiment_id, |w| {
            let decision = match w.check_outcome(&draft)? {
                OutcomeCheck::Duplicate => return Ok(None),
                OutcomeCheck::Ready(d) => d,
            };
            let index = exp
                .variant_index(&decision.variant_id)
                .ok_or_else(|| Error::UnknownVariant {
                    experiment: experiment_id.clone(),
                    variant: decision.variant_id.clone(),
                })?;
            let mut chain = vec![decision.context_key.clone()];
            chain.extend(decision.context_key.ancestors(&drop_order));
            w.append_outcome(draft.clone())?;
            self.store
                .apply_committed(experiment_id, &chain, &decision.variant_id, reward);
            Ok(Some((decision, chain, index)))
        })?;

        let Some((decision, chain, index)) = applied else {
            tracing::debug!(
                experiment = %experiment_id,
                sequence_no = decision_id.sequence_no,
                "duplicate outcome ignored"
            );
            return Ok(OutcomeAck {
                decision_id: decision_id.clone(),
                accepted: false,
                recorded_at: None,
            });
        };

        if reward > 0.0 {
            exp.record_conversion(index);
            self.hierarchy.observe_conversion(experiment_id, &chain, now);
        }
        self.strategies.record_outcome(decision.strategy, reward);
        tracing::debug!(
            experiment = %experiment_id,
            sequence_no = decision_id.sequence_no,
            segment = %decision.context_key,
            variant = %decision.variant_id,
            reward,
            "outcome recorded"
        );
        Ok(OutcomeAck {
            decision_id: decision_id.clone(),
            accepted: true,
            recorded_at: Some(now),
        })
    }

    // --- reporting ---------------------------------------------------------

    pub fn segment_report(&self, id: &ExperimentId) -> Result<Vec<SegmentView>> {
        self.experiment(id)?;
        Ok(self.hierarchy.report(id))
    }

    pub fn variant_report(&self, id: &ExperimentId) -> Result<Vec<VariantView>> {
        Ok(self.experiment(id)?.variant_report())
    }

    /// Samples, conversion rate and credible interval per segment and variant.
    pub fn posterior_report(&self, id: &ExperimentId) -> Result<PosteriorTable> {
        self.experiment(id)?;
        Ok(self.store.table(id))
    }

    pub fn lift_report(&self, id: &ExperimentId) -> Result<Vec<LiftFinding>> {
        let exp = self.experiment(id)?;
        let cfg = LiftConfig {
            min_samples: exp.spec().min_samples_threshold,
            alpha: self.config.lift_alpha,
            top_n: self.config.lift_top_n,
        };
        Ok(lift::analyze(&self.store.table(id), exp.variants(), &cfg))
    }

    /// Verify decisions `from_seq..=to_seq` of the experiment's ledger.
    pub fn verify(&self, id: &ExperimentId, from_seq: u64, to_seq: u64) -> Result<VerificationReport> {
        self.experiment(id)?;
        Ok(self.ledger.verify(id, from_seq, to_seq))
    }

    pub fn flagged_ranges(&self, id: &ExperimentId) -> Result<Vec<FlaggedRange>> {
        self.experiment(id)?;
        Ok(self.ledger.flagged_ranges(id))
    }

    pub fn export_ledger(&self, id: &ExperimentId) -> Result<LedgerExport> {
        self.experiment(id)?;
        Ok(self.ledger.export(id))
    }

    pub fn strategy_benchmark(&self) -> Vec<StrategyBenchmark> {
        self.strategies.benchmark()
    }

    // --- maintenance -------------------------------------------------------

    /// One pruning pass over every experiment's segments.
    pub fn rebuild_hierarchy(&self) -> PruneReport {
        self.hierarchy.rebuild(None, self.clock.now(), &self.config.prune)
    }

    /// Run [`rebuild_hierarchy`](Self::rebuild_hierarchy) every `interval` on
    /// a background thread until the handle is stopped or dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> std::io::Result<MaintenanceHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let tick = interval.min(Duration::from_millis(50)).max(Duration::from_millis(1));
        let thread = thread::Builder::new()
            .name("segmux-maintenance".into())
            .spawn(move || {
                let mut waited = Duration::ZERO;
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(tick);
                    waited += tick;
                    if waited >= interval {
                        waited = Duration::ZERO;
                        engine.rebuild_hierarchy();
                    }
                }
            })?;
        Ok(MaintenanceHandle {
            stop,
            thread: Some(thread),
        })
    }

    // --- persistence -------------------------------------------------------

    pub fn snapshot(&self) -> EngineSnapshot {
        let experiments = self
            .experiment_ids()
            .into_iter()
            .filter_map(|id| self.experiments.get(&id).map(|e| Arc::clone(e.value())))
            .map(|exp| {
                let id = exp.id();
                let mut spec = exp.spec().clone();
                if let Some(s) = self.strategies.get(id) {
                    spec.strategy = s;
                }
                ExperimentSnapshot {
                    status: exp.status(),
                    variants: exp.variant_report(),
                    segments: self.hierarchy.report(id),
                    states: self
                        .store
                        .entries(id)
                        .into_iter()
                        .map(|(k, posterior)| StateSnapshot {
                            segment: k.segment,
                            variant: k.variant,
                            posterior,
                        })
                        .collect(),
                    ledger: self.ledger.export(id).entries,
                    spec,
                }
            })
            .collect();
        EngineSnapshot {
            taken_at: self.clock.now(),
            nonce: self.nonce.load(Ordering::Relaxed),
            experiments,
        }
    }

    /// Install a snapshot into this engine. Every experiment in it must be
    /// new to the engine, and every ledger chain must verify. The snapshot is
    /// checked in full first; on error nothing is installed.
    pub fn restore_snapshot(&self, snapshot: EngineSnapshot) -> Result<()> {
        let mut staged = Vec::with_capacity(snapshot.experiments.len());
        let mut seen = std::collections::HashSet::new();
        for s in snapshot.experiments {
            let id = s.spec.id.clone();
            if self.experiments.contains_key(&id) || !seen.insert(id.clone()) {
                return Err(Error::DuplicateExperiment { experiment: id });
            }
            let exp = Experiment::restore(s.spec, s.status, &s.variants)?;
            self.ledger.check_restore(&id, &s.ledger)?;
            check_variants(&exp, s.states.iter().map(|st| &st.variant))?;
            check_variants(&exp, decision_variants(&s.ledger))?;
            staged.push((exp, s.segments, s.states, s.ledger));
        }
        for (exp, segments, states, ledger) in staged {
            let id = exp.id().clone();
            self.ledger.restore(&id, ledger)?;
            self.strategies.assign(&id, exp.spec().strategy)?;
            for view in &segments {
                self.hierarchy.restore(&id, view);
            }
            for st in states {
                self.store
                    .insert(StateKey::new(&id, &st.segment, &st.variant), st.posterior);
            }
            self.experiments.insert(id, Arc::new(exp));
        }
        self.nonce.fetch_max(snapshot.nonce, Ordering::Relaxed);
        tracing::info!(taken_at = %snapshot.taken_at, "engine snapshot restored");
        Ok(())
    }

    /// Rebuild an experiment's state from its persisted ledger (for example
    /// the output of [`read_jsonl`](crate::read_jsonl)). The experiment must
    /// be registered and have no ledger entries yet; the chain must verify.
    /// Visits, conversions, segment statistics and posteriors are replayed
    /// in ledger order. A rejected ledger leaves the experiment untouched.
    pub fn replay_ledger(&self, id: &ExperimentId, entries: Vec<LedgerEntry>) -> Result<ReplaySummary> {
        let exp = self.experiment(id)?;
        self.ledger.check_restore(id, &entries)?;
        check_variants(&exp, decision_variants(&entries))?;
        for e in &entries {
            if let LedgerEntry::Outcome(o) = e {
                check_reward(o.reward)?;
            }
        }
        self.ledger.restore(id, entries)?;
        let drop_order = exp.spec().context.effective_drop_order();
        let mut summary = ReplaySummary::default();
        for entry in self.ledger.export(id).entries {
            match entry {
                LedgerEntry::Decision(d) => {
                    let Some(index) = exp.variant_index(&d.variant_id) else {
                        continue;
                    };
                    let mut chain = vec![d.context_key.clone()];
                    chain.extend(d.context_key.ancestors(&drop_order));
                    exp.record_visit(index);
                    self.hierarchy.observe_visit(id, &chain, d.decision_timestamp);
                    summary.decisions += 1;
                }
                LedgerEntry::Outcome(o) => {
                    let Some(d) = self.ledger.decision(id, o.decision_sequence_no) else {
                        continue;
                    };
                    let mut chain = vec![d.context_key.clone()];
                    chain.extend(d.context_key.ancestors(&drop_order));
                    self.store.apply_committed(id, &chain, &d.variant_id, o.reward);
                    if o.reward > 0.0 {
                        if let Some(index) = exp.variant_index(&d.variant_id) {
                            exp.record_conversion(index);
                        }
                        self.hierarchy.observe_conversion(id, &chain, o.conversion_timestamp);
                    }
                    summary.outcomes += 1;
                }
            }
        }
        self.nonce.fetch_max(summary.decisions, Ordering::Relaxed);
        tracing::info!(
            experiment = %id,
            decisions = summary.decisions,
            outcomes = summary.outcomes,
            "ledger replayed"
        );
        Ok(summary)
    }
}

fn decision_variants(entries: &[LedgerEntry]) -> impl Iterator<Item = &VariantId> {
    entries.iter().filter_map(|e| match e {
        LedgerEntry::Decision(d) => Some(&d.variant_id),
        LedgerEntry::Outcome(_) => None,
    })
}

/// Every variant named must belong to `exp`.
fn check_variants<'a>(exp: &Experiment, mut variants: impl Iterator<Item = &'a VariantId>) -> Result<()> {
    match variants.find(|v| exp.variant_index(v).is_none()) {
        Some(v) => Err(Error::UnknownVariant {
            experiment: exp.id().clone(),
            variant: v.clone(),
        }),
        None => Ok(()),
    }
}

/// Stops the maintenance thread when stopped or dropped.
#[derive(Debug)]
pub struct MaintenanceHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                tracing::warn!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextConfig, ManualClock};

    fn engine() -> (DecisionEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let e = DecisionEngine::new(EngineConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        (e, clock)
    }

    fn spec() -> ExperimentSpec {
        ExperimentSpec::new("checkout", ["a", "b"])
            .with_context(ContextConfig::new(["source"]))
            .with_min_samples(5)
    }

    #[test]
    fn draft_experiment_rejects_allocation() {
        let (e, _) = engine();
        e.register_experiment(spec()).unwrap();
        let id = ExperimentId::from("checkout");
        let err = e.allocate(&id, "v1", &RawContext::new()).unwrap_err();
        assert_eq!(err.code(), "experiment_not_active");
        assert!(e.export_ledger(&id).unwrap().entries.is_empty());
        assert_eq!(e.register_experiment(spec()).unwrap_err().code(), "duplicate_experiment");
    }

    #[test]
    fn cold_start_is_uniform_at_root_and_logged_first() {
        let (e, _) = engine();
        e.register_experiment(spec()).unwrap();
        let id = ExperimentId::from("checkout");
        e.activate(&id).unwrap();
        let a = e
            .allocate(&id, "v1", &RawContext::new().with("source", "google"))
            .unwrap();
        assert!(a.segment_key.is_root());
        assert_eq!(a.context_key.as_str(), "source:google");
        assert!(a.notes.contains(&AllocationNote::UniformColdStart));
        let x = e.export_ledger(&id).unwrap();
        match &x.entries[0] {
            LedgerEntry::Decision(d) => {
                assert_eq!(d.variant_id, a.variant_id);
                assert_eq!(d.sequence_no, a.decision_id.sequence_no);
            }
            other => panic!("unexpected entry {other:?}"),
        }
        let visits: u64 = e.variant_report(&id).unwrap().iter().map(|v| v.visits).sum();
        assert_eq!(visits, 1);
    }

    #[test]
    fn outcome_updates_every_level_once() {
        let (e, clock) = engine();
        e.register_experiment(spec()).unwrap();
        let id = ExperimentId::from("checkout");
        e.activate(&id).unwrap();
        let a = e
            .allocate(&id, "v1", &RawContext::new().with("source", "google"))
            .unwrap();

        let err = e.record_outcome(&a.decision_id, 1.0, None).unwrap_err();
        assert_eq!(err.code(), "outcome_not_after_decision");

        clock.advance(chrono::Duration::seconds(1));
        assert!(e.record_outcome(&a.decision_id, 1.0, Some(9.99)).unwrap().accepted);
        assert!(!e.record_outcome(&a.decision_id, 1.0, None).unwrap().accepted);

        let t = e.posterior_report(&id).unwrap();
        assert_eq!(t[&SegmentKey::root()][&a.variant_id].samples, 1);
        assert_eq!(t[&a.context_key][&a.variant_id].samples, 1);
        assert!(e.verify(&id, 1, 1).unwrap().is_valid);
    }

    #[test]
    fn invalid_reward_writes_nothing() {
        let (e, clock) = engine();
        e.register_experiment(spec()).unwrap();
        let id = ExperimentId::from("checkout");
        e.activate(&id).unwrap();
        let a = e.allocate(&id, "v1", &RawContext::new()).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(e.record_outcome(&a.decision_id, 1.5, None).unwrap_err().code(), "invalid_reward");
        assert_eq!(e.export_ledger(&id).unwrap().outcomes, 0);
        assert!(e.posterior_report(&id).unwrap().is_empty());
    }

    #[test]
    fn single_variant_is_still_recorded() {
        let (e, _) = engine();
        e.register_experiment(ExperimentSpec::new("solo", ["only"])).unwrap();
        let id = ExperimentId::from("solo");
        e.activate(&id).unwrap();
        let a = e.allocate(&id, "v", &RawContext::new()).unwrap();
        assert_eq!(a.variant_id.as_str(), "only");
        assert!(a.notes.contains(&AllocationNote::SingleVariant));
        assert_eq!(e.export_ledger(&id).unwrap().decisions, 1);
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let cfg = EngineConfig::from_json(r#"{"seed": 7, "allocation_deadline_ms": 5}"#).unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.allocation_deadline, Duration::from_millis(5));
        assert_eq!(cfg.update_attempts, EngineConfig::default().update_attempts);
        assert!(EngineConfig::from_json(r#"{"lift_alpha": 2.0}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"update_attempts": 0}"#).is_err());
    }

    #[test]
    fn unknown_experiment_everywhere() {
        let (e, _) = engine();
        let id = ExperimentId::from("nope");
        assert_eq!(e.allocate(&id, "v", &RawContext::new()).unwrap_err().code(), "unknown_experiment");
        assert!(e.verify(&id, 1, 1).is_err());
        assert!(e.lift_report(&id).is_err());
        assert!(e.record_outcome(&DecisionId::new(id, 1), 1.0, None).is_err());
    }
}
