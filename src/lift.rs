//! Segment lift and significance.
//!
//! Batch, read-only analysis over a [`PosteriorTable`]. For every non-root
//! segment where a variant has enough samples, lift is the relative
//! difference between the variant's conversion rate in that segment and the
//! same variant's rate at root. A one-sample z-test against the root rate
//! gives a two-sided p-value.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::cmp::Ordering;

use crate::{PosteriorTable, SegmentKey, VariantId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiftConfig {
    /// Minimum samples for a `(segment, variant)` pair to be reported.
    pub min_samples: u64,
    /// Significance level for the `significant` flag.
    pub alpha: f64,
    /// Number of findings to return, by descending `|lift|`.
    pub top_n: usize,
}

impl Default for LiftConfig {
    fn default() -> Self {
        Self {
            min_samples: 50,
            alpha: 0.05,
            top_n: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftFinding {
    pub segment: SegmentKey,
    pub variant: VariantId,
    pub samples: u64,
    pub segment_cr: f64,
    pub global_cr: f64,
    pub lift: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub significant: bool,
}

/// Two-sided p-value and z for an observed rate `cr` over `n` samples
/// against a reference rate `p0`.
fn z_test(cr: f64, p0: f64, n: u64) -> (f64, f64) {
    let se = (p0 * (1.0 - p0) / n as f64).sqrt();
    if !(se.is_finite() && se > 0.0) {
        return (0.0, 1.0);
    }
    let z = (cr - p0) / se;
    let p = match Normal::new(0.0, 1.0) {
        Ok(n) => (2.0 * n.sf(z.abs())).clamp(0.0, 1.0),
        Err(_) => 1.0,
    };
    (z, p)
}

/// Top lift findings. `variants` fixes the tie-break order between variants.
pub fn analyze(table: &PosteriorTable, variants: &[VariantId], cfg: &LiftConfig) -> Vec<LiftFinding> {
    let Some(root) = table.get(&SegmentKey::root()) else {
        return Vec::new();
    };
    let order = |v: &VariantId| variants.iter().position(|x| x == v).unwrap_or(usize::MAX);

    let mut findings = Vec::new();
    for (segment, per_variant) in table {
        if segment.is_root() {
            continue;
        }
        for (variant, summary) in per_variant {
            if summary.samples < cfg.min_samples {
                continue;
            }
            let Some(global) = root.get(variant) else {
                continue;
            };
            let global_cr = global.conversion_rate;
            if global_cr <= 0.0 {
                continue;
            }
            let segment_cr = summary.conversion_rate;
            let (z_score, p_value) = z_test(segment_cr, global_cr, summary.samples);
            findings.push(LiftFinding {
                segment: segment.clone(),
                variant: variant.clone(),
                samples: summary.samples,
                segment_cr,
                global_cr,
                lift: (segment_cr - global_cr) / global_cr,
                z_score,
                p_value,
                significant: p_value < cfg.alpha,
            });
        }
    }

    findings.sort_by(|a, b| {
        b.lift
            .abs()
            .partial_cmp(&a.lift.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.segment.cmp(&b.segment))
            .then_with(|| order(&a.variant).cmp(&order(&b.variant)))
    });
    findings.truncate(cfg.top_n);
    findings
}
