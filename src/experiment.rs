//! Experiments, variants and the experiment status machine.
//!
//! Experiments are created by an operator-facing workflow that lives outside
//! this crate; here they are registered from an [`ExperimentSpec`] and only
//! change through [`Experiment::transition`]. Variant counters are reporting
//! aggregates: allocation never reads them.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{ContextConfig, Error, Result, StrategyConfig};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of an experiment.
    ExperimentId
);
string_id!(
    /// Identifier of a variant, unique within its experiment.
    VariantId
);

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    /// Allowed edges: `draft -> active`, `active <-> paused`,
    /// `active|paused -> completed`, anything -> `archived`.
    pub fn can_transition_to(self, to: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Paused, Completed)
                | (Draft | Active | Paused | Completed, Archived)
        )
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Registration payload for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub id: ExperimentId,
    #[serde(default)]
    pub name: String,
    /// Variants in insertion order. Order breaks sampling ties.
    pub variants: Vec<VariantId>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub context: ContextConfig,
    /// Samples every variant needs in a segment before the segment is trusted.
    #[serde(default = "default_min_samples")]
    pub min_samples_threshold: u64,
}

fn default_min_samples() -> u64 {
    50
}

impl ExperimentSpec {
    pub fn new<I, V>(id: impl Into<ExperimentId>, variants: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<VariantId>,
    {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            variants: variants.into_iter().map(Into::into).collect(),
            strategy: StrategyConfig::default(),
            context: ContextConfig::default(),
            min_samples_threshold: default_min_samples(),
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_min_samples(mut self, threshold: u64) -> Self {
        self.min_samples_threshold = threshold;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::InvalidConfig("experiment id must not be empty".into()));
        }
        if self.variants.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "experiment {} has no variants",
                self.id
            )));
        }
        for (i, v) in self.variants.iter().enumerate() {
            if v.as_str().is_empty() {
                return Err(Error::InvalidConfig("variant id must not be empty".into()));
            }
            if self.variants[..i].contains(v) {
                return Err(Error::InvalidConfig(format!("duplicate variant {v}")));
            }
        }
        if self.min_samples_threshold == 0 {
            return Err(Error::InvalidConfig(
                "min_samples_threshold must be >= 1".into(),
            ));
        }
        self.context.validate()?;
        self.strategy.validate()
    }
}

#[derive(Debug, Default)]
struct VariantCounters {
    visits: AtomicU64,
    conversions: AtomicU64,
}

/// Reporting projection of a variant's cumulative counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantView {
    pub variant: VariantId,
    pub visits: u64,
    pub conversions: u64,
}

/// A registered experiment.
#[derive(Debug)]
pub struct Experiment {
    spec: ExperimentSpec,
    status: RwLock<ExperimentStatus>,
    counters: Vec<VariantCounters>,
}

impl Experiment {
    pub(crate) fn new(spec: ExperimentSpec) -> Result<Self> {
        spec.validate()?;
        let counters = spec.variants.iter().map(|_| VariantCounters::default()).collect();
        Ok(Self {
            spec,
            status: RwLock::new(ExperimentStatus::Draft),
            counters,
        })
    }

    pub(crate) fn restore(spec: ExperimentSpec, status: ExperimentStatus, views: &[VariantView]) -> Result<Self> {
        let exp = Self::new(spec)?;
        *exp.status.write() = status;
        for v in views {
            if let Some(i) = exp.variant_index(&v.variant) {
                exp.counters[i].visits.store(v.visits, Ordering::Relaxed);
                exp.counters[i].conversions.store(v.conversions, Ordering::Relaxed);
            }
        }
        Ok(exp)
    }

    pub fn id(&self) -> &ExperimentId {
        &self.spec.id
    }

    pub fn spec(&self) -> &ExperimentSpec {
        &self.spec
    }

    pub fn variants(&self) -> &[VariantId] {
        &self.spec.variants
    }

    pub fn status(&self) -> ExperimentStatus {
        *self.status.read()
    }

    pub fn variant_index(&self, variant: &VariantId) -> Option<usize> {
        self.spec.variants.iter().position(|v| v == variant)
    }

    /// Move to `to`, returning the previous status.
    pub fn transition(&self, to: ExperimentStatus) -> Result<ExperimentStatus> {
        let mut status = self.status.write();
        let from = *status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        *status = to;
        Ok(from)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.status() {
            ExperimentStatus::Active => Ok(()),
            status => Err(Error::ExperimentNotActive {
                experiment: self.spec.id.clone(),
                status,
            }),
        }
    }

    pub(crate) fn record_visit(&self, idx: usize) {
        if let Some(c) = self.counters.get(idx) {
            c.visits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_conversion(&self, idx: usize) {
        if let Some(c) = self.counters.get(idx) {
            c.conversions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn variant_report(&self) -> Vec<VariantView> {
        self.spec
            .variants
            .iter()
            .zip(&self.counters)
            .map(|(v, c)| VariantView {
                variant: v.clone(),
                visits: c.visits.load(Ordering::Relaxed),
                conversions: c.conversions.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_edges() {
        use ExperimentStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Completed));
        assert!(!Archived.can_transition_to(Archived));
        assert!(Completed.can_transition_to(Archived));
    }

    #[test]
    fn rejects_duplicate_and_empty_variants() {
        let spec = ExperimentSpec::new("e1", ["a", "a"]);
        assert!(matches!(Experiment::new(spec), Err(Error::InvalidConfig(_))));
        let spec = ExperimentSpec::new("e1", Vec::<VariantId>::new());
        assert!(matches!(Experiment::new(spec), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn transition_reports_previous_state() {
        let exp = Experiment::new(ExperimentSpec::new("e1", ["a", "b"])).unwrap();
        assert!(exp.ensure_active().is_err());
        assert_eq!(exp.transition(ExperimentStatus::Active).unwrap(), ExperimentStatus::Draft);
        exp.ensure_active().unwrap();
        let err = exp.transition(ExperimentStatus::Draft).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn counters_are_reported_in_insertion_order() {
        let exp = Experiment::new(ExperimentSpec::new("e1", ["b", "a"])).unwrap();
        exp.record_visit(1);
        exp.record_visit(1);
        exp.record_conversion(1);
        let r = exp.variant_report();
        assert_eq!(r[0].variant.as_str(), "b");
        assert_eq!((r[1].visits, r[1].conversions), (2, 1));
    }
}
