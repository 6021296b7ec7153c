//! `segmux`: segmented Thompson-sampling allocation with a decision-first,
//! hash-chained audit ledger.
//!
//! The decision core of an adaptive experimentation platform. Visitors arrive
//! with a raw request context; each one is allocated a variant of an
//! experiment by sampling per-variant Beta posteriors, and observed outcomes
//! update those posteriors. Posteriors are kept per *segment* (a set of
//! context features such as `device:mobile|source:instagram`), so a segment
//! that behaves differently can earn its own allocation once it has enough
//! data.
//!
//! **Pieces:**
//! - [`resolve_context`]: raw attributes to a bounded, canonical feature set.
//! - [`SegmentKey`] / [`cascade_chain`]: canonical keys and the fallback chain
//!   from the most specific segment down to root.
//! - [`SegmentHierarchy`]: per-segment statistics, cascade resolution against
//!   `min_samples_threshold`, background auto-pruning.
//! - [`BetaPosterior`] / [`PosteriorStore`]: Beta-Bernoulli state keyed by
//!   `(experiment, segment, variant)`, per-key locking.
//! - [`StrategyConfig`] / [`StrategyRegistry`]: `thompson`, `ucb`,
//!   `epsilon_greedy` and `adaptive` selection, with performance counters.
//! - [`AuditLedger`]: one SHA-256 hash chain per experiment. A decision is
//!   written before it is returned; an outcome is written before it changes
//!   any posterior. [`JsonlSink`] makes the chain durable.
//! - [`lift::analyze`]: per-segment lift against the root rate, with a
//!   z-test p-value.
//! - [`DecisionEngine`]: the `Send + Sync` facade tying these together.
//!
//! **Determinism:** with a fixed [`EngineConfig::seed`] and an injected
//! [`Clock`], the same sequence of requests yields the same decisions.
//!
//! **Non-goals:** no HTTP surface, no dashboards, no identity resolution
//! across devices, no contextual bandits over continuous features.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use segmux::{
//!     ContextConfig, DecisionEngine, EngineConfig, ExperimentId, ExperimentSpec, ManualClock,
//!     RawContext,
//! };
//!
//! let clock = Arc::new(ManualClock::default());
//! let engine = DecisionEngine::new(EngineConfig::default())?.with_clock(clock.clone());
//! engine.register_experiment(
//!     ExperimentSpec::new("checkout", ["control", "one_click"])
//!         .with_context(ContextConfig::new(["source", "device"])),
//! )?;
//! let id = ExperimentId::from("checkout");
//! engine.activate(&id)?;
//!
//! let raw = RawContext::new()
//!     .with("utm_source", "instagram")
//!     .with("device", "mobile");
//! let alloc = engine.allocate(&id, "visitor-42", &raw)?;
//! assert_eq!(alloc.context_key.as_str(), "device:mobile|source:instagram");
//!
//! clock.advance(chrono::Duration::seconds(30));
//! let ack = engine.record_outcome(&alloc.decision_id, 1.0, Some(24.0))?;
//! assert!(ack.accepted);
//! assert!(engine.verify(&id, 1, 1)?.is_valid);
//! # Ok::<(), segmux::Error>(())
//! ```

#![forbid(unsafe_code)]

mod error;
pub use error::*;

mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

mod experiment;
pub use experiment::*;

mod context;
pub use context::*;

mod segment;
pub use segment::*;

mod posterior;
pub use posterior::{BetaPosterior, PosteriorSummary};

mod store;
pub use store::*;

mod hierarchy;
pub use hierarchy::*;

mod decision;
pub use decision::*;

mod strategy;
pub use strategy::*;

mod stable_hash;
pub use stable_hash::stable_hash64;

mod ledger;
pub use ledger::*;

mod sink;
pub use sink::*;

pub mod lift;
pub use lift::{LiftConfig, LiftFinding};

mod engine;
pub use engine::*;
