//! Decision-first audit ledger.
//!
//! Every experiment owns one append-only chain holding its Decision Records
//! and the Outcome Records that resolve them, in append order. Each record
//! carries the `record_hash` of the record before it (`prev_hash`, or
//! [`GENESIS_HASH`] for the first) and its own SHA-256 `record_hash` over a
//! length-prefixed preimage of its fields, so editing, dropping or reordering
//! any record is detectable by recomputing the chain.
//!
//! Appends for one experiment are serialized by that experiment's mutex;
//! different experiments never contend. Entries reach the [`LedgerSink`]
//! before they become visible in memory.
//!
//! Verification never repairs. A failing range is reported and flagged, and
//! the records stay where they are.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::clock::nanos;
use crate::{
    Error, ExperimentId, LedgerSink, NullSink, Result, SegmentKey, StrategyKind, VariantId,
};

/// `prev_hash` of the first record in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const DECISION_TAG: &str = "segmux.decision.v1";
const OUTCOME_TAG: &str = "segmux.outcome.v1";

// ---------------------------------------------------------------------------
// Records

/// One allocation, as committed to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub sequence_no: u64,
    pub experiment_id: ExperimentId,
    pub visitor_id: String,
    pub variant_id: VariantId,
    pub segment_key_resolved: SegmentKey,
    pub context_key: SegmentKey,
    pub strategy: StrategyKind,
    pub decision_timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub record_hash: String,
}

impl DecisionRecord {
    fn preimage(&self) -> Vec<u8> {
        Preimage::new(DECISION_TAG)
            .u64(self.sequence_no)
            .str(self.experiment_id.as_str())
            .str(&self.visitor_id)
            .str(self.variant_id.as_str())
            .str(self.segment_key_resolved.as_str())
            .str(self.context_key.as_str())
            .str(self.strategy.as_str())
            .instant(&self.decision_timestamp)
            .str(&self.prev_hash)
            .finish()
    }
}

/// Resolution of one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub decision_sequence_no: u64,
    pub experiment_id: ExperimentId,
    pub conversion_timestamp: DateTime<Utc>,
    pub reward: f64,
    pub conversion_value: Option<f64>,
    pub prev_hash: String,
    pub record_hash: String,
}

impl OutcomeRecord {
    fn preimage(&self) -> Vec<u8> {
        Preimage::new(OUTCOME_TAG)
            .u64(self.decision_sequence_no)
            .str(self.experiment_id.as_str())
            .instant(&self.conversion_timestamp)
            .f64(self.reward)
            .opt_f64(self.conversion_value)
            .str(&self.prev_hash)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Decision(DecisionRecord),
    Outcome(OutcomeRecord),
}

impl LedgerEntry {
    pub fn experiment_id(&self) -> &ExperimentId {
        match self {
            LedgerEntry::Decision(d) => &d.experiment_id,
            LedgerEntry::Outcome(o) => &o.experiment_id,
        }
    }

    pub fn prev_hash(&self) -> &str {
        match self {
            LedgerEntry::Decision(d) => &d.prev_hash,
            LedgerEntry::Outcome(o) => &o.prev_hash,
        }
    }

    pub fn record_hash(&self) -> &str {
        match self {
            LedgerEntry::Decision(d) => &d.record_hash,
            LedgerEntry::Outcome(o) => &o.record_hash,
        }
    }

    /// Decision sequence number this entry belongs to.
    pub fn sequence_no(&self) -> u64 {
        match self {
            LedgerEntry::Decision(d) => d.sequence_no,
            LedgerEntry::Outcome(o) => o.decision_sequence_no,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            LedgerEntry::Decision(_) => RecordKind::Decision,
            LedgerEntry::Outcome(_) => RecordKind::Outcome,
        }
    }

    /// Hash recomputed from the stored fields.
    pub fn compute_hash(&self) -> String {
        let preimage = match self {
            LedgerEntry::Decision(d) => d.preimage(),
            LedgerEntry::Outcome(o) => o.preimage(),
        };
        hex::encode(Sha256::digest(&preimage))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Decision,
    Outcome,
}

/// Length-prefixed field encoding: a tag, then each field as
/// `len(u64 BE) || bytes`. Optional values carry a presence byte.
struct Preimage(Vec<u8>);

impl Preimage {
    fn new(tag: &str) -> Self {
        Preimage(Vec::with_capacity(256)).str(tag)
    }

    fn bytes(mut self, b: &[u8]) -> Self {
        self.0.extend_from_slice(&(b.len() as u64).to_be_bytes());
        self.0.extend_from_slice(b);
        self
    }

    fn str(self, s: &str) -> Self {
        self.bytes(s.as_bytes())
    }

    fn u64(self, v: u64) -> Self {
        self.bytes(&v.to_be_bytes())
    }

    /// Whole seconds then sub-second nanos; lossless over chrono's full range.
    fn instant(self, at: &DateTime<Utc>) -> Self {
        self.bytes(&at.timestamp().to_be_bytes())
            .bytes(&at.timestamp_subsec_nanos().to_be_bytes())
    }

    fn f64(self, v: f64) -> Self {
        self.bytes(&v.to_bits().to_be_bytes())
    }

    fn opt_f64(self, v: Option<f64>) -> Self {
        match v {
            None => self.bytes(&[0]),
            Some(x) => self.bytes(&[1]).f64(x),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Drafts

/// Fields of a decision, before the ledger assigns sequence and hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionDraft {
    pub experiment_id: ExperimentId,
    pub visitor_id: String,
    pub variant_id: VariantId,
    pub segment_key_resolved: SegmentKey,
    pub context_key: SegmentKey,
    pub strategy: StrategyKind,
    pub decision_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeDraft {
    pub experiment_id: ExperimentId,
    pub decision_sequence_no: u64,
    pub conversion_timestamp: DateTime<Utc>,
    pub reward: f64,
    pub conversion_value: Option<f64>,
}

// ---------------------------------------------------------------------------
// Verification

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ViolationReason {
    PrevHashMismatch { expected: String, found: String },
    RecordHashMismatch { computed: String, stored: String },
    SequenceGap { expected: u64, found: u64 },
    DuplicateSequence,
    UnknownDecision,
    DuplicateOutcome,
    OutcomeNotAfterDecision,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::PrevHashMismatch { expected, found } => {
                write!(f, "prev_hash {found} does not link to {expected}")
            }
            ViolationReason::RecordHashMismatch { computed, stored } => {
                write!(f, "record_hash {stored} does not match recomputed {computed}")
            }
            ViolationReason::SequenceGap { expected, found } => {
                write!(f, "expected sequence {expected}, found {found}")
            }
            ViolationReason::DuplicateSequence => f.write_str("duplicate sequence number"),
            ViolationReason::UnknownDecision => f.write_str("outcome references no earlier decision"),
            ViolationReason::DuplicateOutcome => f.write_str("second outcome for one decision"),
            ViolationReason::OutcomeNotAfterDecision => {
                f.write_str("conversion_timestamp is not after decision_timestamp")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Decision sequence the offending record belongs to.
    pub sequence_no: u64,
    /// Zero-based position in the experiment's chain.
    pub position: usize,
    pub record: RecordKind,
    pub reason: ViolationReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub experiment_id: ExperimentId,
    pub from_seq: u64,
    pub to_seq: u64,
    /// Records examined in the range.
    pub checked: usize,
    pub is_valid: bool,
    /// In chain order; at most one per record.
    pub violations: Vec<Violation>,
}

impl VerificationReport {
    pub fn first_violation(&self) -> Option<&Violation> {
        self.violations.first()
    }
}

/// A range that failed verification. Flagged ranges are retained, not repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedRange {
    pub from_seq: u64,
    pub to_seq: u64,
    pub first_violation: u64,
    pub violations: usize,
}

/// Check `entries` as the complete chain of `experiment`, reporting on the
/// records belonging to decisions `from_seq..=to_seq`.
///
/// Range membership uses each decision's position in the chain rather than
/// its stored sequence number, so a tampered number cannot move a record out
/// of the checked range. Outcomes belong to the range of the decision they
/// follow.
pub fn verify_chain(
    experiment: &ExperimentId,
    entries: &[LedgerEntry],
    from_seq: u64,
    to_seq: u64,
) -> VerificationReport {
    let mut prev = GENESIS_HASH.to_string();
    let mut next_seq = 1u64;
    let mut ordinal = 0u64;
    let mut decided: BTreeMap<u64, DateTime<Utc>> = BTreeMap::new();
    let mut resolved: BTreeSet<u64> = BTreeSet::new();
    let mut checked = 0usize;
    let mut violations = Vec::new();

    for (position, entry) in entries.iter().enumerate() {
        if entry.kind() == RecordKind::Decision {
            ordinal += 1;
        }
        let in_range = (from_seq..=to_seq).contains(&ordinal);

        let mut reason = None;
        if entry.prev_hash() != prev {
            reason = Some(ViolationReason::PrevHashMismatch {
                expected: prev.clone(),
                found: entry.prev_hash().to_string(),
            });
        }
        if reason.is_none() {
            let computed = entry.compute_hash();
            if computed != entry.record_hash() {
                reason = Some(ViolationReason::RecordHashMismatch {
                    computed,
                    stored: entry.record_hash().to_string(),
                });
            }
        }
        match entry {
            LedgerEntry::Decision(d) => {
                let seq = d.sequence_no;
                if seq == next_seq {
                    next_seq += 1;
                } else if seq < next_seq {
                    reason = reason.or(Some(ViolationReason::DuplicateSequence));
                } else {
                    reason = reason.or(Some(ViolationReason::SequenceGap {
                        expected: next_seq,
                        found: seq,
                    }));
                    next_seq = seq + 1;
                }
                decided.entry(seq).or_insert(d.decision_timestamp);
            }
            LedgerEntry::Outcome(o) => {
                let seq = o.decision_sequence_no;
                let check = match decided.get(&seq) {
                    None => Some(ViolationReason::UnknownDecision),
                    Some(_) if resolved.contains(&seq) => Some(ViolationReason::DuplicateOutcome),
                    Some(ts) if o.conversion_timestamp <= *ts => {
                        Some(ViolationReason::OutcomeNotAfterDecision)
                    }
                    Some(_) => None,
                };
                reason = reason.or(check);
                resolved.insert(seq);
            }
        }
        prev = entry.record_hash().to_string();

        if in_range {
            checked += 1;
            if let Some(reason) = reason {
                violations.push(Violation {
                    sequence_no: entry.sequence_no(),
                    position,
                    record: entry.kind(),
                    reason,
                });
            }
        }
    }

    VerificationReport {
        experiment_id: experiment.clone(),
        from_seq,
        to_seq,
        checked,
        is_valid: violations.is_empty(),
        violations,
    }
}

// ---------------------------------------------------------------------------
// Export

/// Full ordered copy of one experiment's chain, for third-party verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerExport {
    pub experiment_id: ExperimentId,
    pub head_hash: String,
    pub decisions: u64,
    pub outcomes: u64,
    pub entries: Vec<LedgerEntry>,
}

impl LedgerExport {
    /// Verify the whole export as a standalone chain.
    pub fn verify(&self) -> VerificationReport {
        verify_chain(&self.experiment_id, &self.entries, 0, u64::MAX)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

// ---------------------------------------------------------------------------
// Ledger

#[derive(Debug, Default)]
struct Chain {
    entries: Vec<LedgerEntry>,
    /// Entry index of decision `sequence_no = i + 1`.
    decisions: Vec<usize>,
    resolved: BTreeSet<u64>,
    flagged: Vec<FlaggedRange>,
}

impl Chain {
    fn head(&self) -> &str {
        self.entries
            .last()
            .map(LedgerEntry::record_hash)
            .unwrap_or(GENESIS_HASH)
    }

    fn push(&mut self, entry: LedgerEntry) {
        match &entry {
            LedgerEntry::Decision(_) => self.decisions.push(self.entries.len()),
            LedgerEntry::Outcome(o) => {
                self.resolved.insert(o.decision_sequence_no);
            }
        }
        self.entries.push(entry);
    }

    fn decision(&self, sequence_no: u64) -> Option<&DecisionRecord> {
        let idx = usize::try_from(sequence_no.checked_sub(1)?).ok()?;
        match self.entries.get(*self.decisions.get(idx)?) {
            Some(LedgerEntry::Decision(d)) => Some(d),
            _ => None,
        }
    }
}

/// Write access to one experiment's chain, held under its append lock.
pub struct ChainWriter<'a> {
    experiment: &'a ExperimentId,
    chain: &'a mut Chain,
    sink: &'a dyn LedgerSink,
}

/// What an outcome append resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeCheck {
    /// Decision exists, has no outcome yet, and the timestamps are ordered.
    Ready(DecisionRecord),
    /// The decision already has an outcome.
    Duplicate,
}

impl ChainWriter<'_> {
    pub fn decision(&self, sequence_no: u64) -> Option<&DecisionRecord> {
        self.chain.decision(sequence_no)
    }

    /// Validate an outcome against the chain without writing anything.
    pub fn check_outcome(&self, draft: &OutcomeDraft) -> Result<OutcomeCheck> {
        let decision = self
            .chain
            .decision(draft.decision_sequence_no)
            .ok_or_else(|| Error::UnknownDecision {
                experiment: self.experiment.clone(),
                sequence_no: draft.decision_sequence_no,
            })?;
        if self.chain.resolved.contains(&draft.decision_sequence_no) {
            return Ok(OutcomeCheck::Duplicate);
        }
        if draft.conversion_timestamp <= decision.decision_timestamp {
            return Err(Error::OutcomeNotAfterDecision {
                sequence_no: draft.decision_sequence_no,
                decision_ns: nanos(&decision.decision_timestamp),
                conversion_ns: nanos(&draft.conversion_timestamp),
            });
        }
        Ok(OutcomeCheck::Ready(decision.clone()))
    }

    /// Seal and commit a decision: assign the next sequence number, link,
    /// hash, hand to the sink, then publish.
    pub fn append_decision(&mut self, draft: DecisionDraft) -> Result<DecisionRecord> {
        let mut record = DecisionRecord {
            sequence_no: self.chain.decisions.len() as u64 + 1,
            experiment_id: draft.experiment_id,
            visitor_id: draft.visitor_id,
            variant_id: draft.variant_id,
            segment_key_resolved: draft.segment_key_resolved,
            context_key: draft.context_key,
            strategy: draft.strategy,
            decision_timestamp: draft.decision_timestamp,
            prev_hash: self.chain.head().to_string(),
            record_hash: String::new(),
        };
        record.record_hash = hex::encode(Sha256::digest(record.preimage()));
        self.commit(LedgerEntry::Decision(record.clone()))?;
        Ok(record)
    }

    /// Seal and commit an outcome previously accepted by [`check_outcome`].
    ///
    /// [`check_outcome`]: ChainWriter::check_outcome
    pub fn append_outcome(&mut self, draft: OutcomeDraft) -> Result<OutcomeRecord> {
        let mut record = OutcomeRecord {
            decision_sequence_no: draft.decision_sequence_no,
            experiment_id: draft.experiment_id,
            conversion_timestamp: draft.conversion_timestamp,
            reward: draft.reward,
            conversion_value: draft.conversion_value,
            prev_hash: self.chain.head().to_string(),
            record_hash: String::new(),
        };
        record.record_hash = hex::encode(Sha256::digest(record.preimage()));
        self.commit(LedgerEntry::Outcome(record.clone()))?;
        Ok(record)
    }

    fn commit(&mut self, entry: LedgerEntry) -> Result<()> {
        if let Err(e) = self.sink.append(&entry) {
            tracing::warn!(
                experiment = %self.experiment,
                sequence_no = entry.sequence_no(),
                error = %e,
                "ledger sink rejected entry"
            );
            return Err(Error::Sink(e));
        }
        self.chain.push(entry);
        Ok(())
    }
}

/// Per-experiment hash chains behind per-experiment locks.
#[derive(Debug)]
pub struct AuditLedger {
    chains: DashMap<ExperimentId, Arc<Mutex<Chain>>>,
    sink: Arc<dyn LedgerSink>,
}

impl Default for AuditLedger {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl AuditLedger {
    pub fn new(sink: Arc<dyn LedgerSink>) -> Self {
        Self {
            chains: DashMap::new(),
            sink,
        }
    }

    fn chain(&self, experiment: &ExperimentId) -> Arc<Mutex<Chain>> {
        if let Some(c) = self.chains.get(experiment) {
            return Arc::clone(c.value());
        }
        Arc::clone(self.chains.entry(experiment.clone()).or_default().value())
    }

    /// Run `f` with exclusive append access to `experiment`'s chain.
    pub fn with_writer<T>(
        &self,
        experiment: &ExperimentId,
        f: impl FnOnce(&mut ChainWriter<'_>) -> Result<T>,
    ) -> Result<T> {
        let chain = self.chain(experiment);
        let mut guard = chain.lock();
        let mut writer = ChainWriter {
            experiment,
            chain: &mut guard,
            sink: self.sink.as_ref(),
        };
        f(&mut writer)
    }

    pub fn append_decision(&self, draft: DecisionDraft) -> Result<DecisionRecord> {
        let experiment = draft.experiment_id.clone();
        self.with_writer(&experiment, |w| w.append_decision(draft))
    }

    /// Append an outcome. `Ok(None)` means the decision already had one.
    pub fn append_outcome(&self, draft: OutcomeDraft) -> Result<Option<OutcomeRecord>> {
        let experiment = draft.experiment_id.clone();
        self.with_writer(&experiment, |w| match w.check_outcome(&draft)? {
            OutcomeCheck::Duplicate => Ok(None),
            OutcomeCheck::Ready(_) => w.append_outcome(draft).map(Some),
        })
    }

    pub fn decision(&self, experiment: &ExperimentId, sequence_no: u64) -> Option<DecisionRecord> {
        let chain = self.chains.get(experiment).map(|c| Arc::clone(c.value()))?;
        let guard = chain.lock();
        guard.decision(sequence_no).cloned()
    }

    /// Number of decisions recorded for `experiment`.
    pub fn decision_count(&self, experiment: &ExperimentId) -> u64 {
        self.chains
            .get(experiment)
            .map(|c| Arc::clone(c.value()))
            .map(|c| c.lock().decisions.len() as u64)
            .unwrap_or(0)
    }

    fn entries(&self, experiment: &ExperimentId) -> Vec<LedgerEntry> {
        match self.chains.get(experiment).map(|c| Arc::clone(c.value())) {
            Some(chain) => chain.lock().entries.clone(),
            None => Vec::new(),
        }
    }

    /// Verify decisions `from_seq..=to_seq` and the outcomes that follow them.
    /// A failing range is flagged; nothing is repaired.
    pub fn verify(&self, experiment: &ExperimentId, from_seq: u64, to_seq: u64) -> VerificationReport {
        let entries = self.entries(experiment);
        let report = verify_chain(experiment, &entries, from_seq, to_seq);
        if let Some(first) = report.first_violation() {
            tracing::warn!(
                experiment = %experiment,
                from_seq,
                to_seq,
                first = first.sequence_no,
                reason = %first.reason,
                violations = report.violations.len(),
                "ledger verification failed"
            );
            let flag = FlaggedRange {
                from_seq,
                to_seq,
                first_violation: first.sequence_no,
                violations: report.violations.len(),
            };
            let chain = self.chain(experiment);
            let mut guard = chain.lock();
            if !guard.flagged.contains(&flag) {
                guard.flagged.push(flag);
            }
        }
        report
    }

    /// Ranges that failed verification, oldest first.
    pub fn flagged_ranges(&self, experiment: &ExperimentId) -> Vec<FlaggedRange> {
        match self.chains.get(experiment).map(|c| Arc::clone(c.value())) {
            Some(chain) => chain.lock().flagged.clone(),
            None => Vec::new(),
        }
    }

    pub fn export(&self, experiment: &ExperimentId) -> LedgerExport {
        let entries = self.entries(experiment);
        let decisions = entries
            .iter()
            .filter(|e| e.kind() == RecordKind::Decision)
            .count() as u64;
        LedgerExport {
            experiment_id: experiment.clone(),
            head_hash: entries
                .last()
                .map(|e| e.record_hash().to_string())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            decisions,
            outcomes: entries.len() as u64 - decisions,
            entries,
        }
    }

    /// Re-install a previously persisted chain. The chain must verify in
    /// full, and `experiment` must not have entries yet. Entries are not
    /// re-sent to the sink.
    pub fn restore(&self, experiment: &ExperimentId, entries: Vec<LedgerEntry>) -> Result<()> {
        self.check_restore(experiment, &entries)?;
        let chain = self.chain(experiment);
        let mut guard = chain.lock();
        if !guard.entries.is_empty() {
            return Err(already_populated(experiment));
        }
        for entry in entries {
            guard.push(entry);
        }
        tracing::info!(
            experiment = %experiment,
            decisions = guard.decisions.len(),
            "ledger chain restored"
        );
        Ok(())
    }

    /// Everything [`restore`](Self::restore) checks, without installing.
    pub fn check_restore(&self, experiment: &ExperimentId, entries: &[LedgerEntry]) -> Result<()> {
        let report = verify_chain(experiment, entries, 0, u64::MAX);
        if let Some(v) = report.first_violation() {
            return Err(Error::ChainBroken {
                experiment: experiment.clone(),
                sequence_no: v.sequence_no,
                reason: v.reason.to_string(),
            });
        }
        if let Some(foreign) = entries.iter().find(|e| e.experiment_id() != experiment) {
            return Err(Error::ChainBroken {
                experiment: experiment.clone(),
                sequence_no: foreign.sequence_no(),
                reason: format!("entry belongs to experiment {}", foreign.experiment_id()),
            });
        }
        let populated = self
            .chains
            .get(experiment)
            .map(|c| Arc::clone(c.value()))
            .is_some_and(|c| !c.lock().entries.is_empty());
        if populated {
            return Err(already_populated(experiment));
        }
        Ok(())
    }
}

fn already_populated(experiment: &ExperimentId) -> Error {
    Error::ChainBroken {
        experiment: experiment.clone(),
        sequence_no: 0,
        reason: "ledger already holds entries".into(),
    }
}
