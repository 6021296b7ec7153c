//! Segment keys and the cascade chain.
//!
//! A segment key is the canonical encoding of a set of context features:
//! `name:value` pairs sorted by name and joined with `|`, for example
//! `device:mobile|source:instagram`. The root segment has no features and
//! encodes as the empty string.
//!
//! Parents are never stored. A key's parent is computed by dropping its most
//! granular feature according to the experiment's drop order, so the
//! hierarchy can be walked from any key without a live tree.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Feature, Result};

/// Canonical segment key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SegmentKey {
    canonical: String,
}

impl SegmentKey {
    /// The root segment (no features).
    pub fn root() -> Self {
        Self {
            canonical: String::new(),
        }
    }

    /// Build a key from features. Input order does not matter; names and
    /// values are lower-cased; a repeated name keeps its first value after sorting.
    pub fn from_features(features: &[Feature]) -> Self {
        let mut pairs: Vec<(String, String)> = features
            .iter()
            .map(|f| (f.name.to_ascii_lowercase(), f.value.to_lowercase()))
            .collect();
        pairs.sort();
        pairs.dedup_by(|a, b| a.0 == b.0);
        Self::from_sorted(&pairs)
    }

    fn from_sorted(pairs: &[(String, String)]) -> Self {
        let canonical = pairs
            .iter()
            .map(|(n, v)| format!("{n}:{v}"))
            .collect::<Vec<_>>()
            .join("|");
        Self { canonical }
    }

    /// Parse and re-canonicalize a key string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut features = Vec::new();
        for part in s.split('|') {
            let (name, value) = part
                .split_once(':')
                .filter(|(n, v)| !n.is_empty() && !v.is_empty() && !v.contains(':'))
                .ok_or_else(|| Error::MalformedContext(format!("bad segment key part {part:?}")))?;
            features.push(Feature::new(name, value));
        }
        Ok(Self::from_features(&features))
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn is_root(&self) -> bool {
        self.canonical.is_empty()
    }

    /// Number of features in the key.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.canonical.split('|').count()
        }
    }

    /// `(name, value)` pairs in canonical order.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        if self.is_root() {
            return Vec::new();
        }
        self.canonical
            .split('|')
            .filter_map(|p| p.split_once(':'))
            .collect()
    }

    /// Parent key: this key without its most granular feature.
    ///
    /// The most granular feature is the first entry of `drop_order` present in
    /// the key; when none is listed, the last feature in canonical order is
    /// dropped. Root has no parent.
    pub fn parent(&self, drop_order: &[String]) -> Option<SegmentKey> {
        if self.is_root() {
            return None;
        }
        let pairs = self.pairs();
        let victim = drop_order
            .iter()
            .find_map(|d| pairs.iter().position(|(n, _)| *n == d.as_str()))
            .unwrap_or(pairs.len() - 1);
        let kept: Vec<(String, String)> = pairs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != victim)
            .map(|(_, (n, v))| (n.to_string(), v.to_string()))
            .collect();
        Some(Self::from_sorted(&kept))
    }

    /// Ancestors of this key, nearest first, ending at root.
    pub fn ancestors(&self, drop_order: &[String]) -> Vec<SegmentKey> {
        let mut out = Vec::with_capacity(self.depth());
        let mut cur = self.parent(drop_order);
        while let Some(k) = cur {
            cur = k.parent(drop_order);
            out.push(k);
        }
        out
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.canonical)
        }
    }
}

impl TryFrom<String> for SegmentKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<SegmentKey> for String {
    fn from(k: SegmentKey) -> String {
        k.canonical
    }
}

/// Candidate keys from most specific (all features) to root.
pub fn cascade_chain(features: &[Feature], drop_order: &[String]) -> Vec<SegmentKey> {
    let leaf = SegmentKey::from_features(features);
    let mut chain = vec![leaf.clone()];
    chain.extend(leaf.ancestors(drop_order));
    chain
}
