//! Context resolution: raw request attributes to canonical context features.
//!
//! [`resolve_context`] is a pure function. It keeps only the features named by
//! the experiment's allow-list and maps every raw value into a bounded
//! vocabulary, so that segment keys built from the output stay low-cardinality.
//! Values outside a vocabulary become [`UNKNOWN`].

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Value used for anything outside a feature's vocabulary.
pub const UNKNOWN: &str = "unknown";

pub const FEATURE_SOURCE: &str = "source";
pub const FEATURE_DEVICE: &str = "device";
pub const FEATURE_COUNTRY: &str = "country";
pub const FEATURE_HOUR_BUCKET: &str = "hour_bucket";

/// Default traffic-source vocabulary.
pub const SOURCE_VOCABULARY: &[&str] = &[
    "direct", "google", "bing", "facebook", "instagram", "twitter", "linkedin", "tiktok",
    "youtube", "email",
];

/// Referrer host fragments and the source they map to. First match wins.
const REFERRER_HOSTS: &[(&str, &str)] = &[
    ("instagram.", "instagram"),
    ("facebook.", "facebook"),
    ("fb.", "facebook"),
    ("google.", "google"),
    ("bing.", "bing"),
    ("t.co", "twitter"),
    ("twitter.", "twitter"),
    ("x.com", "twitter"),
    ("linkedin.", "linkedin"),
    ("lnkd.in", "linkedin"),
    ("tiktok.", "tiktok"),
    ("youtube.", "youtube"),
    ("youtu.be", "youtube"),
];

/// One normalized `(name, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: String,
}

impl Feature {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_ascii_lowercase(),
            value: value.into().trim().to_lowercase(),
        }
    }
}

/// Raw request attributes as received from the client.
///
/// Attribute names are case-insensitive. Recognized names: `source`,
/// `utm_source`, `referrer`, `user_agent`, `device`, `country`, `hour`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawContext {
    pub attributes: BTreeMap<String, String>,
    /// Request time; used for `hour_bucket` when no `hour` attribute is given.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes
            .insert(name.trim().to_ascii_lowercase(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Per-experiment context configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Allow-list of feature names. Empty means every visitor lands in root.
    #[serde(default)]
    pub features: Vec<String>,
    /// Drop priority for the cascade, most granular first. Features not named
    /// here are dropped afterwards, last allow-listed first.
    #[serde(default)]
    pub drop_order: Vec<String>,
    /// Bounded vocabularies, overriding the built-in ones.
    #[serde(default)]
    pub vocabularies: BTreeMap<String, Vec<String>>,
}

impl ContextConfig {
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            features: features
                .into_iter()
                .map(|f| f.into().trim().to_ascii_lowercase())
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_drop_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drop_order = order
            .into_iter()
            .map(|f| f.into().trim().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_vocabulary<I, S>(mut self, feature: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vocabularies.insert(
            feature.trim().to_ascii_lowercase(),
            values
                .into_iter()
                .map(|v| v.into().trim().to_lowercase())
                .collect(),
        );
        self
    }

    /// Full drop order over the allow-list, most granular first.
    pub fn effective_drop_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::with_capacity(self.features.len());
        for f in &self.drop_order {
            if self.features.contains(f) && !order.contains(f) {
                order.push(f.clone());
            }
        }
        for f in self.features.iter().rev() {
            if !order.contains(f) {
                order.push(f.clone());
            }
        }
        order
    }

    /// Names, drop-order entries and vocabulary values all end up inside
    /// segment keys, so none may be empty or contain `|` or `:`.
    pub(crate) fn validate(&self) -> Result<()> {
        for f in self.features.iter().chain(&self.drop_order) {
            if !is_key_part(f) {
                return Err(Error::MalformedContext(format!(
                    "invalid feature name {f:?}"
                )));
            }
        }
        for (feature, values) in &self.vocabularies {
            if !is_key_part(feature) {
                return Err(Error::MalformedContext(format!(
                    "invalid vocabulary feature {feature:?}"
                )));
            }
            if let Some(v) = values.iter().find(|v| !is_key_part(v)) {
                return Err(Error::MalformedContext(format!(
                    "invalid vocabulary value {v:?} for {feature}"
                )));
            }
        }
        Ok(())
    }

    fn in_vocabulary(&self, feature: &str, value: String, builtin: Option<&[&str]>) -> String {
        let allowed = match (self.vocabularies.get(feature), builtin) {
            (Some(v), _) => v.iter().any(|x| *x == value),
            (None, Some(b)) => b.contains(&value.as_str()),
            (None, None) => true,
        };
        if allowed {
            value
        } else {
            UNKNOWN.to_string()
        }
    }
}

/// Normalize `raw` against `cfg`. Output is sorted by feature name.
pub fn resolve_context(raw: &RawContext, cfg: &ContextConfig) -> Result<Vec<Feature>> {
    cfg.validate()?;
    let mut out: Vec<Feature> = Vec::with_capacity(cfg.features.len());
    for name in &cfg.features {
        if out.iter().any(|f| &f.name == name) {
            continue;
        }
        let value = match name.as_str() {
            FEATURE_DEVICE => {
                let v = raw
                    .get("device")
                    .map(|v| v.trim().to_lowercase())
                    .unwrap_or_else(|| device_class(raw.get("user_agent")).to_string());
                cfg.in_vocabulary(name, v, Some(&["mobile", "desktop", "tablet"]))
            }
            FEATURE_SOURCE => {
                let v = raw
                    .get("source")
                    .or_else(|| raw.get("utm_source"))
                    .map(|v| v.trim().to_lowercase())
                    .unwrap_or_else(|| source_from_referrer(raw.get("referrer")).to_string());
                cfg.in_vocabulary(name, v, Some(SOURCE_VOCABULARY))
            }
            FEATURE_COUNTRY => {
                let v = match raw.get("country") {
                    Some(c) if c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => {
                        c.to_ascii_lowercase()
                    }
                    _ => UNKNOWN.to_string(),
                };
                cfg.in_vocabulary(name, v, None)
            }
            FEATURE_HOUR_BUCKET => {
                let hour = match raw.get("hour") {
                    Some(h) => Some(h.parse::<u32>().ok().filter(|h| *h < 24).ok_or_else(
                        || Error::MalformedContext(format!("hour {h:?} is not in 0..24")),
                    )?),
                    None => raw.timestamp.map(|t| t.hour()),
                };
                hour.map(hour_bucket).unwrap_or(UNKNOWN).to_string()
            }
            other => {
                let v = raw
                    .get(other)
                    .map(|v| v.trim().to_lowercase())
                    .unwrap_or_else(|| UNKNOWN.to_string());
                if !cfg.vocabularies.contains_key(other) && v.contains(['|', ':']) {
                    return Err(Error::MalformedContext(format!(
                        "value for {other} contains a reserved character"
                    )));
                }
                cfg.in_vocabulary(other, v, None)
            }
        };
        let value = value.trim();
        out.push(Feature::new(name.as_str(), if value.is_empty() { UNKNOWN } else { value }));
    }
    out.sort();
    Ok(out)
}

/// Coarse device class from a user-agent string.
pub fn device_class(user_agent: Option<&str>) -> &'static str {
    let Some(ua) = user_agent else {
        return UNKNOWN;
    };
    let ua = ua.to_ascii_lowercase();
    if ua.contains("ipad")
        || ua.contains("tablet")
        || ua.contains("kindle")
        || ua.contains("silk/")
        || (ua.contains("android") && !ua.contains("mobile"))
    {
        "tablet"
    } else if ua.contains("mobi")
        || ua.contains("iphone")
        || ua.contains("ipod")
        || ua.contains("android")
        || ua.contains("blackberry")
        || ua.contains("opera mini")
        || ua.contains("windows phone")
    {
        "mobile"
    } else {
        "desktop"
    }
}

/// Traffic source implied by a referrer URL. No referrer means `direct`.
pub fn source_from_referrer(referrer: Option<&str>) -> &'static str {
    let Some(r) = referrer else {
        return "direct";
    };
    let r = r.to_ascii_lowercase();
    let host = r
        .split("://")
        .nth(1)
        .unwrap_or(&r)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("");
    let host = host.strip_prefix("www.").unwrap_or(host);
    REFERRER_HOSTS
        .iter()
        .find(|(frag, _)| host.starts_with(frag) || host.contains(&format!(".{frag}")))
        .map(|(_, s)| *s)
        .unwrap_or(UNKNOWN)
}

fn is_key_part(s: &str) -> bool {
    !s.is_empty() && !s.contains(['|', ':'])
}

fn hour_bucket(hour: u32) -> &'static str {
    match hour {
        0..=5 => "night",
        6..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}
