//! Allocation strategies and the per-experiment strategy registry.
//!
//! Every strategy sees the same input: one [`BetaPosterior`] snapshot per
//! variant, in the experiment's insertion order, and a seeded `StdRng`. Ties
//! always go to the earliest variant, so with a fixed seed a decision is fully
//! reproducible.
//!
//! - `thompson`: sample each posterior, pick the max.
//! - `ucb`: UCB1 over posterior means; untried variants first.
//! - `epsilon_greedy`: uniform with probability `epsilon`, else best mean.
//! - `adaptive`: epsilon-greedy whose epsilon decays with total samples,
//!   `min(1, epsilon0 / sqrt(1 + N / 100))`.

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{AllocationNote, BetaPosterior, Error, ExperimentId, Result};

/// Strategy family, used for reporting and ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Thompson,
    Ucb,
    EpsilonGreedy,
    Adaptive,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Thompson,
        StrategyKind::Ucb,
        StrategyKind::EpsilonGreedy,
        StrategyKind::Adaptive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Thompson => "thompson",
            StrategyKind::Ucb => "ucb",
            StrategyKind::EpsilonGreedy => "epsilon_greedy",
            StrategyKind::Adaptive => "adaptive",
        }
    }

    fn index(self) -> usize {
        match self {
            StrategyKind::Thompson => 0,
            StrategyKind::Ucb => 1,
            StrategyKind::EpsilonGreedy => 2,
            StrategyKind::Adaptive => 3,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one selection: an index into the posterior slice, plus why.
#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
    pub index: usize,
    pub note: AllocationNote,
}

/// A selection rule over per-variant posteriors.
pub trait AllocationStrategy {
    fn kind(&self) -> StrategyKind;

    /// Choose one arm. Returns `None` only if `arms` is empty.
    fn select(&self, arms: &[BetaPosterior], rng: &mut StdRng) -> Option<Pick>;
}

/// First index of the maximum score; earlier indices win ties.
fn argmax(scores: impl IntoIterator<Item = f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, s) in scores.into_iter().enumerate() {
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Thompson;

impl AllocationStrategy for Thompson {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Thompson
    }

    fn select(&self, arms: &[BetaPosterior], rng: &mut StdRng) -> Option<Pick> {
        let draws: Vec<f64> = arms.iter().map(|p| p.sample(rng)).collect();
        argmax(draws).map(|index| Pick {
            index,
            note: AllocationNote::SampledPosteriorMax,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ucb {
    /// Exploration coefficient.
    pub c: f64,
}

impl Default for Ucb {
    fn default() -> Self {
        Self {
            c: std::f64::consts::SQRT_2,
        }
    }
}

impl AllocationStrategy for Ucb {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Ucb
    }

    fn select(&self, arms: &[BetaPosterior], _rng: &mut StdRng) -> Option<Pick> {
        if arms.is_empty() {
            return None;
        }
        if let Some(index) = arms.iter().position(|p| p.samples == 0) {
            return Some(Pick {
                index,
                note: AllocationNote::UntriedFirst,
            });
        }
        let total: u64 = arms.iter().map(|p| p.samples).sum();
        let ln_n = (total as f64).ln().max(0.0);
        let bonus = |p: &BetaPosterior| self.c * (ln_n / p.samples as f64).sqrt();
        let index = argmax(arms.iter().map(|p| p.mean() + bonus(p)))?;
        Some(Pick {
            index,
            note: AllocationNote::UpperConfidenceMax {
                bonus: bonus(&arms[index]),
            },
        })
    }
}

fn epsilon_pick(arms: &[BetaPosterior], epsilon: f64, rng: &mut StdRng) -> Option<Pick> {
    if arms.is_empty() {
        return None;
    }
    if rng.random::<f64>() < epsilon {
        return Some(Pick {
            index: rng.random_range(0..arms.len()),
            note: AllocationNote::RandomExplore { epsilon },
        });
    }
    argmax(arms.iter().map(BetaPosterior::mean)).map(|index| Pick {
        index,
        note: AllocationNote::GreedyMean { epsilon },
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonGreedy {
    pub epsilon: f64,
}

impl Default for EpsilonGreedy {
    fn default() -> Self {
        Self { epsilon: 0.1 }
    }
}

impl AllocationStrategy for EpsilonGreedy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EpsilonGreedy
    }

    fn select(&self, arms: &[BetaPosterior], rng: &mut StdRng) -> Option<Pick> {
        epsilon_pick(arms, self.epsilon, rng)
    }
}

/// Epsilon-greedy with a schedule that decays as evidence accumulates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adaptive {
    pub epsilon0: f64,
}

impl Default for Adaptive {
    fn default() -> Self {
        Self { epsilon0: 0.5 }
    }
}

impl Adaptive {
    /// Effective epsilon after `total_samples` observations.
    #[must_use]
    pub fn epsilon(&self, total_samples: u64) -> f64 {
        (self.epsilon0 / (1.0 + total_samples as f64 / 100.0).sqrt()).min(1.0)
    }
}

impl AllocationStrategy for Adaptive {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn select(&self, arms: &[BetaPosterior], rng: &mut StdRng) -> Option<Pick> {
        let n: u64 = arms.iter().map(|p| p.samples).sum();
        epsilon_pick(arms, self.epsilon(n), rng)
    }
}

// ---------------------------------------------------------------------------

/// Serializable strategy choice for an experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum StrategyConfig {
    #[default]
    Thompson,
    Ucb { c: f64 },
    EpsilonGreedy { epsilon: f64 },
    Adaptive { epsilon0: f64 },
}

impl StrategyConfig {
    /// Named strategy with default parameters.
    pub fn named(name: &str) -> Result<Self> {
        match name {
            "thompson" => Ok(StrategyConfig::Thompson),
            "ucb" => Ok(StrategyConfig::Ucb { c: Ucb::default().c }),
            "epsilon_greedy" => Ok(StrategyConfig::EpsilonGreedy {
                epsilon: EpsilonGreedy::default().epsilon,
            }),
            "adaptive" => Ok(StrategyConfig::Adaptive {
                epsilon0: Adaptive::default().epsilon0,
            }),
            other => Err(Error::InvalidConfig(format!("unknown strategy {other:?}"))),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let bad = |what: &str, v: f64| Error::InvalidConfig(format!("{what} out of range: {v}"));
        match *self {
            StrategyConfig::Thompson => Ok(()),
            StrategyConfig::Ucb { c } if !(c.is_finite() && c >= 0.0) => Err(bad("ucb c", c)),
            StrategyConfig::EpsilonGreedy { epsilon } if !(0.0..=1.0).contains(&epsilon) => {
                Err(bad("epsilon", epsilon))
            }
            StrategyConfig::Adaptive { epsilon0 } if !(epsilon0.is_finite() && epsilon0 >= 0.0) => {
                Err(bad("epsilon0", epsilon0))
            }
            _ => Ok(()),
        }
    }
}

impl AllocationStrategy for StrategyConfig {
    fn kind(&self) -> StrategyKind {
        match self {
            StrategyConfig::Thompson => StrategyKind::Thompson,
            StrategyConfig::Ucb { .. } => StrategyKind::Ucb,
            StrategyConfig::EpsilonGreedy { .. } => StrategyKind::EpsilonGreedy,
            StrategyConfig::Adaptive { .. } => StrategyKind::Adaptive,
        }
    }

    fn select(&self, arms: &[BetaPosterior], rng: &mut StdRng) -> Option<Pick> {
        match *self {
            StrategyConfig::Thompson => Thompson.select(arms, rng),
            StrategyConfig::Ucb { c } => Ucb { c }.select(arms, rng),
            StrategyConfig::EpsilonGreedy { epsilon } => EpsilonGreedy { epsilon }.select(arms, rng),
            StrategyConfig::Adaptive { epsilon0 } => Adaptive { epsilon0 }.select(arms, rng),
        }
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    selections: AtomicU64,
    latency_ns: AtomicU64,
    outcomes: AtomicU64,
    conversions: AtomicU64,
}

/// Per-strategy performance, as reported by [`StrategyRegistry::benchmark`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyBenchmark {
    pub strategy: StrategyKind,
    pub experiments: usize,
    pub selections: u64,
    pub mean_selection_latency: Duration,
    pub outcomes: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

/// Experiment to strategy mapping, plus lock-free performance counters.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    assigned: DashMap<ExperimentId, StrategyConfig>,
    counters: [Counters; 4],
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign (or replace) the strategy of an experiment.
    pub fn assign(&self, experiment: &ExperimentId, config: StrategyConfig) -> Result<()> {
        config.validate()?;
        self.assigned.insert(experiment.clone(), config);
        Ok(())
    }

    /// Strategy currently assigned to `experiment`.
    pub fn get(&self, experiment: &ExperimentId) -> Option<StrategyConfig> {
        self.assigned.get(experiment).map(|c| *c.value())
    }

    pub fn record_selection(&self, kind: StrategyKind, latency: Duration) {
        let c = &self.counters[kind.index()];
        c.selections.fetch_add(1, Ordering::Relaxed);
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        c.latency_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, kind: StrategyKind, reward: f64) {
        let c = &self.counters[kind.index()];
        c.outcomes.fetch_add(1, Ordering::Relaxed);
        if reward > 0.0 {
            c.conversions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One row per strategy kind, in [`StrategyKind::ALL`] order.
    pub fn benchmark(&self) -> Vec<StrategyBenchmark> {
        StrategyKind::ALL
            .iter()
            .map(|&kind| {
                let c = &self.counters[kind.index()];
                let selections = c.selections.load(Ordering::Relaxed);
                let outcomes = c.outcomes.load(Ordering::Relaxed);
                let conversions = c.conversions.load(Ordering::Relaxed);
                let mean_ns = if selections == 0 {
                    0
                } else {
                    c.latency_ns.load(Ordering::Relaxed) / selections
                };
                StrategyBenchmark {
                    strategy: kind,
                    experiments: self.assigned.iter().filter(|e| e.value().kind() == kind).count(),
                    selections,
                    mean_selection_latency: Duration::from_nanos(mean_ns),
                    outcomes,
                    conversions,
                    conversion_rate: if outcomes == 0 {
                        0.0
                    } else {
                        conversions as f64 / outcomes as f64
                    },
                }
            })
            .collect()
    }
}
