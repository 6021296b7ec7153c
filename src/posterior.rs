//! Beta-Bernoulli posterior for one variant within one segment.
//!
//! Rewards in `[0, 1]` are treated as fractional successes:
//! `alpha += reward`, `beta += 1 - reward`, `samples += 1`.

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// z-value for a two-sided 95% interval.
const Z_95: f64 = 1.96;

/// Posterior state `(alpha, beta, samples)`, starting from the uniform prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPosterior {
    pub alpha: f64,
    pub beta: f64,
    pub samples: u64,
}

impl Default for BetaPosterior {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            samples: 0,
        }
    }
}

impl BetaPosterior {
    /// Apply one outcome. Rejects rewards outside `[0, 1]` and non-finite values.
    pub fn update(&mut self, reward: f64) -> Result<()> {
        let r = check_reward(reward)?;
        self.apply(r);
        Ok(())
    }

    /// [`update`](Self::update) for a reward already checked.
    pub(crate) fn apply(&mut self, r: f64) {
        self.alpha += r;
        self.beta += 1.0 - r;
        self.samples = self.samples.saturating_add(1);
    }

    /// Posterior mean `alpha / (alpha + beta)`.
    pub fn mean(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 {
            0.5
        } else {
            self.alpha / denom
        }
    }

    /// Observed conversion rate `(alpha - 1) / (alpha + beta - 2)`; `0` before
    /// any sample.
    pub fn conversion_rate(&self) -> f64 {
        let n = self.alpha + self.beta - 2.0;
        if self.samples == 0 || n <= 0.0 {
            0.0
        } else {
            ((self.alpha - 1.0) / n).clamp(0.0, 1.0)
        }
    }

    /// 95% credible interval, normal approximation to the Beta, clipped to `[0, 1]`.
    /// Understates width at low sample counts.
    pub fn credible_interval(&self) -> (f64, f64) {
        let s = self.alpha + self.beta;
        let var = (self.alpha * self.beta) / (s * s * (s + 1.0));
        let half = Z_95 * var.max(0.0).sqrt();
        let m = self.mean();
        ((m - half).clamp(0.0, 1.0), (m + half).clamp(0.0, 1.0))
    }

    /// Draw one sample from `Beta(alpha, beta)`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if !(self.alpha.is_finite() && self.beta.is_finite()) || self.alpha <= 0.0 || self.beta <= 0.0
        {
            return 0.5;
        }
        match Beta::new(self.alpha, self.beta) {
            Ok(dist) => dist.sample(rng),
            Err(_) => 0.5,
        }
    }
}

pub(crate) fn check_reward(reward: f64) -> Result<f64> {
    if reward.is_finite() && (0.0..=1.0).contains(&reward) {
        Ok(reward)
    } else {
        Err(Error::InvalidReward(reward))
    }
}

/// Reporting projection: derived statistics only, never `alpha`/`beta`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub samples: u64,
    pub conversion_rate: f64,
    pub credible_interval: (f64, f64),
}

impl From<&BetaPosterior> for PosteriorSummary {
    fn from(p: &BetaPosterior) -> Self {
        Self {
            samples: p.samples,
            conversion_rate: p.conversion_rate(),
            credible_interval: p.credible_interval(),
        }
    }
}
