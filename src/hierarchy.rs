//! Segment hierarchy: per-segment aggregates, cascade resolution, pruning.
//!
//! Segments live in an arena keyed by `(experiment, segment key)`. Nodes are
//! created lazily on first observation and never removed; pruning only flips
//! a flag that takes the node out of resolution. All counters are atomics so
//! the request path and the background rebuild only ever share read access to
//! the map shards.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::clock::nanos;
use crate::{BetaPosterior, ExperimentId, PosteriorStore, SegmentKey, VariantId};

/// Auto-pruning policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruneConfig {
    /// How long a segment may exist before it must have earned `min_visits`.
    #[serde(rename = "retention_ms", with = "crate::clock::millis")]
    pub retention: Duration,
    /// Visits a segment needs within `retention` to stay active.
    pub min_visits: u64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            min_visits: 50,
        }
    }
}

#[derive(Debug)]
struct SegmentNode {
    total_visits: AtomicU64,
    total_conversions: AtomicU64,
    first_seen_ns: i64,
    last_seen_ns: AtomicI64,
    pruned: AtomicBool,
}

impl SegmentNode {
    fn new(at_ns: i64) -> Self {
        Self {
            total_visits: AtomicU64::new(0),
            total_conversions: AtomicU64::new(0),
            first_seen_ns: at_ns,
            last_seen_ns: AtomicI64::new(at_ns),
            pruned: AtomicBool::new(false),
        }
    }
}

/// Reporting projection of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentView {
    pub key: SegmentKey,
    pub total_visits: u64,
    pub total_conversions: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub pruned: bool,
}

/// Outcome of a pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub examined: usize,
    pub pruned: usize,
    pub revived: usize,
    pub active: usize,
}

/// Segment chosen for a decision, with the posteriors it was resolved against.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub segment: SegmentKey,
    /// Index of `segment` in the cascade chain (0 = most specific).
    pub level: usize,
    /// Snapshots aligned with the experiment's variant order.
    pub posteriors: Vec<BetaPosterior>,
}

impl Resolution {
    /// Whether the resolved segment is root.
    pub fn is_root(&self) -> bool {
        self.segment.is_root()
    }
}

type NodeKey = (ExperimentId, SegmentKey);

#[derive(Debug, Default)]
pub struct SegmentHierarchy {
    nodes: DashMap<NodeKey, SegmentNode>,
}

impl SegmentHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_node<F: FnOnce(&SegmentNode)>(&self, experiment: &ExperimentId, key: &SegmentKey, at_ns: i64, f: F) {
        let nk = (experiment.clone(), key.clone());
        if let Some(node) = self.nodes.get(&nk) {
            f(node.value());
            return;
        }
        let node = self.nodes.entry(nk).or_insert_with(|| SegmentNode::new(at_ns));
        f(node.value());
    }

    /// Record one visit on every segment of `chain`.
    pub fn observe_visit(&self, experiment: &ExperimentId, chain: &[SegmentKey], at: DateTime<Utc>) {
        let at_ns = nanos(&at);
        for key in chain {
            self.with_node(experiment, key, at_ns, |n| {
                n.total_visits.fetch_add(1, Ordering::Relaxed);
                n.last_seen_ns.fetch_max(at_ns, Ordering::Relaxed);
            });
        }
    }

    /// Record one conversion on every segment of `chain`.
    pub fn observe_conversion(&self, experiment: &ExperimentId, chain: &[SegmentKey], at: DateTime<Utc>) {
        let at_ns = nanos(&at);
        for key in chain {
            self.with_node(experiment, key, at_ns, |n| {
                n.total_conversions.fetch_add(1, Ordering::Relaxed);
                n.last_seen_ns.fetch_max(at_ns, Ordering::Relaxed);
            });
        }
    }

    /// Whether `key` is excluded from resolution. Root never is.
    pub fn is_pruned(&self, experiment: &ExperimentId, key: &SegmentKey) -> bool {
        if key.is_root() {
            return false;
        }
        self.nodes
            .get(&(experiment.clone(), key.clone()))
            .map(|n| n.pruned.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Walk `chain` from most specific to root and pick the first active
    /// segment where every variant has at least `min_samples` samples. Root is
    /// always eligible. Returns `None` only if a posterior snapshot could not
    /// be taken before `deadline`.
    pub fn resolve(
        &self,
        store: &PosteriorStore,
        experiment: &ExperimentId,
        chain: &[SegmentKey],
        variants: &[VariantId],
        min_samples: u64,
        deadline: Instant,
    ) -> Option<Resolution> {
        for (level, key) in chain.iter().enumerate() {
            if key.is_root() {
                break;
            }
            if self.is_pruned(experiment, key) {
                continue;
            }
            let posteriors = store.snapshot(experiment, key, variants, deadline)?;
            if posteriors.iter().all(|p| p.samples >= min_samples) {
                return Some(Resolution {
                    segment: key.clone(),
                    level,
                    posteriors,
                });
            }
        }
        let root = SegmentKey::root();
        let posteriors = store.snapshot(experiment, &root, variants, deadline)?;
        Some(Resolution {
            level: chain.len().saturating_sub(1),
            segment: root,
            posteriors,
        })
    }

    /// Recompute the active set: prune segments older than the retention
    /// window that still have fewer than `min_visits` visits, revive pruned
    /// segments that have since qualified. Data is never dropped.
    pub fn rebuild(&self, experiment: Option<&ExperimentId>, now: DateTime<Utc>, cfg: &PruneConfig) -> PruneReport {
        let now_ns = nanos(&now);
        let retention_ns = i64::try_from(cfg.retention.as_nanos()).unwrap_or(i64::MAX);
        let mut report = PruneReport::default();
        for entry in self.nodes.iter() {
            let (exp, key) = entry.key();
            if experiment.is_some_and(|e| e != exp) {
                continue;
            }
            report.examined += 1;
            let node = entry.value();
            if key.is_root() {
                report.active += 1;
                continue;
            }
            let aged = now_ns.saturating_sub(node.first_seen_ns) >= retention_ns;
            let sparse = node.total_visits.load(Ordering::Relaxed) < cfg.min_visits;
            let prune = aged && sparse;
            let was = node.pruned.swap(prune, Ordering::Relaxed);
            match (was, prune) {
                (false, true) => report.pruned += 1,
                (true, false) => report.revived += 1,
                _ => {}
            }
            if !prune {
                report.active += 1;
            }
        }
        tracing::info!(
            examined = report.examined,
            pruned = report.pruned,
            revived = report.revived,
            active = report.active,
            "segment hierarchy rebuilt"
        );
        report
    }

    /// All segments of `experiment`, ordered by key (root first).
    pub fn report(&self, experiment: &ExperimentId) -> Vec<SegmentView> {
        let mut out: Vec<SegmentView> = self
            .nodes
            .iter()
            .filter(|e| &e.key().0 == experiment)
            .map(|e| {
                let n = e.value();
                SegmentView {
                    key: e.key().1.clone(),
                    total_visits: n.total_visits.load(Ordering::Relaxed),
                    total_conversions: n.total_conversions.load(Ordering::Relaxed),
                    first_seen_at: Utc.timestamp_nanos(n.first_seen_ns),
                    last_seen_at: Utc.timestamp_nanos(n.last_seen_ns.load(Ordering::Relaxed)),
                    pruned: n.pruned.load(Ordering::Relaxed),
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub(crate) fn restore(&self, experiment: &ExperimentId, view: &SegmentView) {
        let node = SegmentNode::new(nanos(&view.first_seen_at));
        node.total_visits.store(view.total_visits, Ordering::Relaxed);
        node.total_conversions.store(view.total_conversions, Ordering::Relaxed);
        node.last_seen_ns.store(nanos(&view.last_seen_at), Ordering::Relaxed);
        node.pruned.store(view.pruned, Ordering::Relaxed);
        self.nodes.insert((experiment.clone(), view.key.clone()), node);
    }
}
