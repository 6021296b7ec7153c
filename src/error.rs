//! Error taxonomy.
//!
//! Every failure the crate surfaces belongs to one of three classes
//! ([`ErrorKind`]): input errors are rejected before any state is written,
//! contention errors are safe to retry, integrity errors need an operator.
//! Data sparsity is never an error; the cascade resolver absorbs it.

use crate::{ExperimentId, ExperimentStatus, VariantId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error class, used by callers to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request or unknown entity. Never retry unchanged.
    Input,
    /// Concurrent update collision that outlived the retry budget. Safe to retry.
    Contention,
    /// Ledger integrity or durability failure. Requires investigation.
    Integrity,
}

/// Errors returned by the decision core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown experiment: {0}")]
    UnknownExperiment(ExperimentId),

    #[error("experiment {experiment} already registered")]
    DuplicateExperiment { experiment: ExperimentId },

    #[error("unknown variant {variant} in experiment {experiment}")]
    UnknownVariant {
        experiment: ExperimentId,
        variant: VariantId,
    },

    #[error("unknown decision {sequence_no} in experiment {experiment}")]
    UnknownDecision {
        experiment: ExperimentId,
        sequence_no: u64,
    },

    #[error("experiment {experiment} is {status}, not active")]
    ExperimentNotActive {
        experiment: ExperimentId,
        status: ExperimentStatus,
    },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("malformed context: {0}")]
    MalformedContext(String),

    #[error("reward must be a finite value in [0, 1], got {0}")]
    InvalidReward(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("update on {key} still contended after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error(
        "outcome for decision {sequence_no} at {conversion_ns}ns does not follow decision at {decision_ns}ns"
    )]
    OutcomeNotAfterDecision {
        sequence_no: u64,
        decision_ns: i64,
        conversion_ns: i64,
    },

    #[error("ledger chain for {experiment} broken at sequence {sequence_no}: {reason}")]
    ChainBroken {
        experiment: ExperimentId,
        sequence_no: u64,
        reason: String,
    },

    #[error("durable ledger write failed: {0}")]
    Sink(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownExperiment(_)
            | Self::DuplicateExperiment { .. }
            | Self::UnknownVariant { .. }
            | Self::UnknownDecision { .. }
            | Self::ExperimentNotActive { .. }
            | Self::InvalidTransition { .. }
            | Self::MalformedContext(_)
            | Self::InvalidReward(_)
            | Self::InvalidConfig(_) => ErrorKind::Input,
            Self::Contention { .. } => ErrorKind::Contention,
            Self::OutcomeNotAfterDecision { .. }
            | Self::ChainBroken { .. }
            | Self::Sink(_)
            | Self::Serialization(_) => ErrorKind::Integrity,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownExperiment(_) => "unknown_experiment",
            Self::DuplicateExperiment { .. } => "duplicate_experiment",
            Self::UnknownVariant { .. } => "unknown_variant",
            Self::UnknownDecision { .. } => "unknown_decision",
            Self::ExperimentNotActive { .. } => "experiment_not_active",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::MalformedContext(_) => "malformed_context",
            Self::InvalidReward(_) => "invalid_reward",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Contention { .. } => "contention",
            Self::OutcomeNotAfterDecision { .. } => "outcome_not_after_decision",
            Self::ChainBroken { .. } => "chain_broken",
            Self::Sink(_) => "sink_failure",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}
