//! Allocation envelope returned to callers.
//!
//! An [`Allocation`] is the caller-facing view of a decision that has already
//! been written to the audit ledger. Besides the chosen variant it carries a
//! typed [`AllocationNote`] list explaining how the choice happened: which
//! segment the cascade settled on, whether a fallback kicked in, and what the
//! strategy did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ExperimentId, SegmentKey, StrategyKind, VariantId};

/// Stable identity of a decision: its position in the experiment's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecisionId {
    pub experiment_id: ExperimentId,
    pub sequence_no: u64,
}

impl DecisionId {
    pub fn new(experiment_id: ExperimentId, sequence_no: u64) -> Self {
        Self {
            experiment_id,
            sequence_no,
        }
    }
}

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.experiment_id, self.sequence_no)
    }
}

/// Audit-friendly notes attached to an allocation.
///
/// Notes are small, typed and stable. Prefer adding new variants over changing
/// existing semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum AllocationNote {
    /// A non-root segment had enough samples for every variant.
    CascadeResolved { level: usize },

    /// No segment on the chain was powered; root was used.
    RootFallback { skipped_pruned: usize },

    /// Root was resolved while some variant had no samples there.
    UniformColdStart,

    /// The experiment has a single variant.
    SingleVariant,

    /// Posterior snapshots were not available before the allocation deadline.
    DeadlineFallback,

    /// Sampled every variant's posterior and chose the max.
    SampledPosteriorMax,

    /// An untried variant was chosen ahead of scored ones (insertion order).
    UntriedFirst,

    /// Chose the largest upper confidence bound.
    UpperConfidenceMax { bonus: f64 },

    /// Exploration step of an epsilon schedule.
    RandomExplore { epsilon: f64 },

    /// Exploitation step of an epsilon schedule: largest posterior mean.
    GreedyMean { epsilon: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub decision_id: DecisionId,
    pub variant_id: VariantId,
    /// Segment whose posteriors drove the choice.
    pub segment_key: SegmentKey,
    /// Most specific segment of the visitor's context.
    pub context_key: SegmentKey,
    pub strategy: StrategyKind,
    pub decided_at: DateTime<Utc>,
    pub notes: Vec<AllocationNote>,
}

impl Allocation {
    /// Whether any fallback (root, cold start or deadline) shaped this choice.
    pub fn fell_back(&self) -> bool {
        self.notes.iter().any(|n| {
            matches!(
                n,
                AllocationNote::RootFallback { .. }
                    | AllocationNote::UniformColdStart
                    | AllocationNote::DeadlineFallback
            )
        })
    }

    pub fn has_note(&self, pred: impl Fn(&AllocationNote) -> bool) -> bool {
        self.notes.iter().any(pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_serialize_with_stable_tags() {
        let n = AllocationNote::CascadeResolved { level: 1 };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"note":"cascade_resolved","level":1}"#);
        let back: AllocationNote = serde_json::from_str(&json).unwrap();
        assert_eq!(back, n);
        assert_eq!(
            serde_json::to_string(&AllocationNote::DeadlineFallback).unwrap(),
            r#"{"note":"deadline_fallback"}"#
        );
    }

    #[test]
    fn decision_id_display() {
        let id = DecisionId::new(ExperimentId::from("checkout"), 42);
        assert_eq!(id.to_string(), "checkout#42");
    }
}
