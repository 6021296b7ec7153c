//! Keyed posterior store: `(experiment, segment, variant) -> BetaPosterior`.
//!
//! Each key owns its own `RwLock` cell inside a sharded map, so updates are
//! serialized per key and never across experiments. Readers copy the
//! `(alpha, beta)` pair out under a read lock and release it immediately;
//! a reader that cannot get a snapshot before its deadline gives up and lets
//! the caller fall back, rather than waiting behind writers.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::posterior::check_reward;
use crate::{BetaPosterior, Error, ExperimentId, PosteriorSummary, Result, SegmentKey, VariantId};

/// Address of one variant-segment state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub experiment: ExperimentId,
    pub segment: SegmentKey,
    pub variant: VariantId,
}

impl StateKey {
    pub fn new(experiment: &ExperimentId, segment: &SegmentKey, variant: &VariantId) -> Self {
        Self {
            experiment: experiment.clone(),
            segment: segment.clone(),
            variant: variant.clone(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.experiment, self.segment, self.variant)
    }
}

/// Retry budget for contended updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Lock attempts before surfacing [`Error::Contention`].
    pub attempts: u32,
    /// How long each attempt waits for the write lock.
    pub lock_timeout: Duration,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            lock_timeout: Duration::from_millis(20),
        }
    }
}

/// Per-segment summaries for one experiment, as handed to reporting.
pub type PosteriorTable = BTreeMap<SegmentKey, BTreeMap<VariantId, PosteriorSummary>>;

type Cell = Arc<RwLock<BetaPosterior>>;

#[derive(Debug, Default)]
pub struct PosteriorStore {
    cells: DashMap<StateKey, Cell>,
    policy: UpdatePolicy,
}

impl PosteriorStore {
    pub fn new(policy: UpdatePolicy) -> Self {
        Self {
            cells: DashMap::new(),
            policy,
        }
    }

    /// Number of materialized states.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Posterior for one key; the prior if the key was never updated.
    pub fn get(&self, key: &StateKey) -> BetaPosterior {
        match self.cells.get(key).map(|c| Arc::clone(c.value())) {
            Some(cell) => *cell.read(),
            None => BetaPosterior::default(),
        }
    }

    /// Consistent per-key snapshots of `variants` in `segment`, in the given
    /// order. Returns `None` if any cell stays write-locked past `deadline`.
    /// Missing keys read as the prior and are not created.
    pub fn snapshot(
        &self,
        experiment: &ExperimentId,
        segment: &SegmentKey,
        variants: &[VariantId],
        deadline: Instant,
    ) -> Option<Vec<BetaPosterior>> {
        let mut out = Vec::with_capacity(variants.len());
        for v in variants {
            let key = StateKey::new(experiment, segment, v);
            let cell = self.cells.get(&key).map(|c| Arc::clone(c.value()));
            match cell {
                None => out.push(BetaPosterior::default()),
                Some(cell) => out.push(*cell.try_read_until(deadline)?),
            }
        }
        Some(out)
    }

    /// Apply `reward` to `variant` in every segment of `chain`, atomically:
    /// all cells are locked before any is changed, so a contention failure
    /// leaves every posterior untouched.
    pub fn update_chain(
        &self,
        experiment: &ExperimentId,
        chain: &[SegmentKey],
        variant: &VariantId,
        reward: f64,
    ) -> Result<()> {
        let reward = check_reward(reward)?;
        let cells = self.chain_cells(experiment, chain, variant);
        let mut guards = Vec::with_capacity(cells.len());
        for (key, cell) in &cells {
            let mut attempts = 0u32;
            let guard = loop {
                attempts += 1;
                if let Some(g) = cell.try_write_for(self.policy.lock_timeout) {
                    break g;
                }
                if attempts >= self.policy.attempts.max(1) {
                    tracing::warn!(key = %key, attempts, "posterior update exhausted retries");
                    return Err(Error::Contention {
                        key: key.to_string(),
                        attempts,
                    });
                }
            };
            guards.push(guard);
        }
        for g in &mut guards {
            g.apply(reward);
        }
        Ok(())
    }

    /// Apply an already-checked reward once its Outcome Record is committed.
    ///
    /// Callers serialize on the experiment's ledger lock, so the only other
    /// lock holders are readers copying a snapshot out; the write locks are
    /// taken blocking and held just for the arithmetic.
    pub(crate) fn apply_committed(
        &self,
        experiment: &ExperimentId,
        chain: &[SegmentKey],
        variant: &VariantId,
        reward: f64,
    ) {
        let cells = self.chain_cells(experiment, chain, variant);
        let mut guards: Vec<_> = cells.iter().map(|(_, cell)| cell.write()).collect();
        for g in &mut guards {
            g.apply(reward);
        }
    }

    /// Cells for `variant` along `chain`, created on demand, in lock order:
    /// deepest segment first, then key text. A chain never holds two keys of
    /// equal depth, so any two chains agree on order.
    fn chain_cells(
        &self,
        experiment: &ExperimentId,
        chain: &[SegmentKey],
        variant: &VariantId,
    ) -> Vec<(StateKey, Cell)> {
        let mut keys: Vec<StateKey> = chain
            .iter()
            .map(|s| StateKey::new(experiment, s, variant))
            .collect();
        keys.sort_by(|a, b| {
            b.segment
                .depth()
                .cmp(&a.segment.depth())
                .then_with(|| a.segment.cmp(&b.segment))
        });
        keys.dedup();
        keys.into_iter()
            .map(|k| {
                let cell = Arc::clone(
                    self.cells
                        .entry(k.clone())
                        .or_insert_with(|| Arc::new(RwLock::new(BetaPosterior::default())))
                        .value(),
                );
                (k, cell)
            })
            .collect()
    }

    /// Reporting view of every state in `experiment`.
    pub fn table(&self, experiment: &ExperimentId) -> PosteriorTable {
        let mut out = PosteriorTable::new();
        for (key, post) in self.entries(experiment) {
            out.entry(key.segment)
                .or_default()
                .insert(key.variant, PosteriorSummary::from(&post));
        }
        out
    }

    /// Raw states of `experiment`, ordered by key. Crate-internal: raw
    /// parameters never cross the reporting boundary.
    pub(crate) fn entries(&self, experiment: &ExperimentId) -> Vec<(StateKey, BetaPosterior)> {
        let cells: Vec<(StateKey, Cell)> = self
            .cells
            .iter()
            .filter(|e| &e.key().experiment == experiment)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut out: Vec<(StateKey, BetaPosterior)> =
            cells.into_iter().map(|(k, c)| (k, *c.read())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub(crate) fn insert(&self, key: StateKey, posterior: BetaPosterior) {
        self.cells.insert(key, Arc::new(RwLock::new(posterior)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e() -> ExperimentId {
        ExperimentId::from("e1")
    }

    #[test]
    fn read_does_not_materialize_state() {
        let s = PosteriorStore::default();
        let deadline = Instant::now() + Duration::from_millis(10);
        let snap = s
            .snapshot(&e(), &SegmentKey::root(), &[VariantId::from("a")], deadline)
            .unwrap();
        assert_eq!(snap[0], BetaPosterior::default());
        assert!(s.is_empty());
    }

    #[test]
    fn chain_update_touches_every_level() {
        let s = PosteriorStore::default();
        let chain = vec![
            SegmentKey::parse("device:mobile|source:google").unwrap(),
            SegmentKey::parse("source:google").unwrap(),
            SegmentKey::root(),
        ];
        let a = VariantId::from("a");
        s.update_chain(&e(), &chain, &a, 1.0).unwrap();
        s.update_chain(&e(), &chain, &a, 0.0).unwrap();
        for seg in &chain {
            let p = s.get(&StateKey::new(&e(), seg, &a));
            assert_eq!((p.alpha, p.beta, p.samples), (2.0, 2.0, 2));
        }
    }

    #[test]
    fn invalid_reward_changes_nothing() {
        let s = PosteriorStore::default();
        let a = VariantId::from("a");
        assert!(s.update_chain(&e(), &[SegmentKey::root()], &a, 2.0).is_err());
        assert!(s.is_empty());
    }

    #[test]
    fn committed_apply_matches_checked_update() {
        let s = PosteriorStore::default();
        let a = VariantId::from("a");
        let chain = vec![SegmentKey::parse("source:google").unwrap(), SegmentKey::root()];
        s.apply_committed(&e(), &chain, &a, 1.0);
        s.update_chain(&e(), &chain, &a, 0.0).unwrap();
        for seg in &chain {
            let p = s.get(&StateKey::new(&e(), seg, &a));
            assert_eq!((p.alpha, p.beta, p.samples), (2.0, 2.0, 2));
        }
    }

    #[test]
    fn held_write_lock_surfaces_contention() {
        let s = PosteriorStore::new(UpdatePolicy {
            attempts: 2,
            lock_timeout: Duration::from_millis(1),
        });
        let a = VariantId::from("a");
        let root = SegmentKey::root();
        s.update_chain(&e(), &[root.clone()], &a, 1.0).unwrap();

        let cell = Arc::clone(s.cells.get(&StateKey::new(&e(), &root, &a)).unwrap().value());
        let _held = cell.write();
        let err = s.update_chain(&e(), &[root.clone()], &a, 1.0).unwrap_err();
        assert!(err.is_retryable());

        let past = Instant::now();
        assert!(s.snapshot(&e(), &root, &[a], past).is_none());
    }
}
