//! Core type definitions for the reconciliation engine.
//!
//! Defines the fundamental data structures flowing through the pipeline:
//! observation records, tagged field values, redundancy/time labels,
//! conflict cases, and consolidated events.

use crate::schema::{FieldId, FieldType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique, sortable capture key. Keys order records by capture instant;
/// the engine asserts (rather than imposes) this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(pub String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        RecordKey(s.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        RecordKey(s)
    }
}

/// Normalized status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusValue {
    Ok,
    Ng,
}

impl std::fmt::Display for StatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusValue::Ok => write!(f, "OK"),
            StatusValue::Ng => write!(f, "NG"),
        }
    }
}

/// A successfully validated, normalized field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum NormalizedValue {
    Status(StatusValue),
    Integer(i64),
    Float(f64),
    Time(String),
}

impl NormalizedValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NormalizedValue::Integer(i) => Some(*i as f64),
            NormalizedValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The declared type this value was normalized against.
    pub fn field_type(&self) -> FieldType {
        match self {
            NormalizedValue::Status(_) => FieldType::Status,
            NormalizedValue::Integer(_) => FieldType::Integer,
            NormalizedValue::Float(_) => FieldType::Float,
            NormalizedValue::Time(_) => FieldType::Time,
        }
    }
}

impl std::fmt::Display for NormalizedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizedValue::Status(s) => write!(f, "{s}"),
            NormalizedValue::Integer(i) => write!(f, "{i}"),
            NormalizedValue::Float(v) => write!(f, "{v}"),
            NormalizedValue::Time(t) => write!(f, "{t}"),
        }
    }
}

/// A field value as it sits inside a record: either validated/normalized,
/// or invalid with its raw reading preserved. Only the validator (initial
/// tagging) and the escalator (symmetric patching) mutate these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FieldValue {
    Valid(NormalizedValue),
    Invalid { raw: String, reason: String },
}

impl FieldValue {
    /// Wrap a raw reader string, not yet validated. The validator replaces
    /// this tag on its first pass.
    pub fn raw(raw: impl Into<String>) -> Self {
        FieldValue::Invalid {
            raw: raw.into(),
            reason: "unvalidated".to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, FieldValue::Valid(_))
    }

    /// Numeric view, available only for valid Integer/Float values.
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            FieldValue::Valid(v) => v.as_f64(),
            FieldValue::Invalid { .. } => None,
        }
    }

    /// Canonical string used for fingerprint comparison and oracle context.
    /// Invalid values compare by their raw reading.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Valid(v) => v.to_string(),
            FieldValue::Invalid { raw, .. } => raw.trim().to_string(),
        }
    }
}

/// One observation as delivered by the field reader, after validation
/// tagging. Never deleted; at most folded into a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// Unique capture key, sortable by capture order.
    pub key: RecordKey,
    /// Wall-clock instant the observation was captured.
    pub capture_time: DateTime<Utc>,
    /// Raw device-reported clock string; repeats across records when the
    /// device clock stalls.
    pub device_time: String,
    /// Field readings keyed by field id.
    pub fields: HashMap<FieldId, FieldValue>,
}

impl ObservationRecord {
    pub fn new(
        key: impl Into<RecordKey>,
        capture_time: DateTime<Utc>,
        device_time: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            capture_time,
            device_time: device_time.into(),
            fields: HashMap::new(),
        }
    }

    pub fn field(&self, id: &FieldId) -> Option<&FieldValue> {
        self.fields.get(id)
    }

    pub fn set_field(&mut self, id: impl Into<FieldId>, value: FieldValue) {
        self.fields.insert(id.into(), value);
    }

    /// Attach a raw reader string for a field, pending validation.
    pub fn set_raw(&mut self, id: impl Into<FieldId>, raw: impl Into<String>) {
        self.fields.insert(id.into(), FieldValue::raw(raw));
    }
}

/// Fuzzy redundancy links for one record, against its neighbors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedundancyLabel {
    pub redundant_with_prev: bool,
    pub redundant_with_next: bool,
    pub similarity_prev: f64,
    pub similarity_next: f64,
    /// Keys of the neighbor records this one fuzzy-matched.
    pub matched_keys: Vec<RecordKey>,
}

impl RedundancyLabel {
    pub fn is_redundant(&self) -> bool {
        self.redundant_with_prev || self.redundant_with_next
    }
}

/// Device-clock phase of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePhase {
    /// Device clock advanced (or first record of the batch).
    New,
    /// Device clock unchanged from the predecessor.
    Static,
    /// Device clock unchanged for at least the frozen threshold.
    Frozen,
}

/// Time-state label for one record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeState {
    pub phase: TimePhase,
    /// Seconds elapsed since the current device-clock state began.
    pub duration_since_state_start: f64,
}

impl TimeState {
    pub fn new_state() -> Self {
        Self {
            phase: TimePhase::New,
            duration_since_state_start: 0.0,
        }
    }
}

/// Labels attached to one record by the sequential labeling pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLabels {
    pub redundancy: RedundancyLabel,
    pub time_state: TimeState,
}

/// Opaque handle to reader-supplied evidence (e.g. an image crop) backing
/// one field of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceHandle(pub String);

impl EvidenceHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }
}

/// Batch-level center of a field's valid values, handed to the oracle as
/// context: the median for numeric fields, the most common value otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldCenter {
    Median(f64),
    Mode(String),
}

impl std::fmt::Display for FieldCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldCenter::Median(m) => write!(f, "{m:.3}"),
            FieldCenter::Mode(m) => write!(f, "most common: {m}"),
        }
    }
}

/// A suspected reader error inside a duplicate capture: two fuzzy-matched
/// records disagree on one field. Created during labeling, consumed by the
/// escalator (resolved or marked unresolved).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictCase {
    pub field_id: FieldId,
    pub field_type: FieldType,
    pub current_key: RecordKey,
    pub compared_key: RecordKey,
    /// Canonical reading of the current (later) record.
    pub current_value: String,
    /// Canonical reading of the compared (earlier) record.
    pub compared_value: String,
    pub evidence_current: Option<EvidenceHandle>,
    pub evidence_compared: Option<EvidenceHandle>,
    /// Batch-level center of this field, for oracle context.
    pub contextual_median: Option<FieldCenter>,
    /// Similarity score of the pair that produced this case.
    pub similarity: f64,
}

/// Escalation outcome for one conflict case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Oracle agreed with the earlier reading; the later one was noise.
    ConfirmedRedundant,
    /// Oracle agreed with the later reading; the state genuinely changed.
    GenuineChange,
    /// Oracle proposed a third value disagreeing with both readings.
    NewValue,
    /// Oracle unavailable or evidence missing; nothing was patched.
    Unresolved,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::ConfirmedRedundant => write!(f, "confirmed redundant"),
            Verdict::GenuineChange => write!(f, "genuine change"),
            Verdict::NewValue => write!(f, "new value"),
            Verdict::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// Final consolidated output unit: one real-world machine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Fields taken from the chain's representative record.
    pub fields: HashMap<FieldId, FieldValue>,
    /// Earliest capture instant in the chain.
    pub capture_time: DateTime<Utc>,
    /// Number of records folded into this event.
    pub chain_size: usize,
    pub chain_start_key: RecordKey,
    pub chain_end_key: RecordKey,
    /// Key of the record whose field values this event carries.
    pub representative_key: RecordKey,
    /// Seconds elapsed since the previous retained event's capture instant.
    /// Zero for the first event of a batch.
    pub real_freeze_duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_canonical() {
        let v = FieldValue::Valid(NormalizedValue::Integer(97));
        assert_eq!(v.canonical(), "97");

        let v = FieldValue::Valid(NormalizedValue::Status(StatusValue::Ng));
        assert_eq!(v.canonical(), "NG");

        let v = FieldValue::Invalid {
            raw: " 9.1289 ".into(),
            reason: "excess precision".into(),
        };
        assert_eq!(v.canonical(), "9.1289");
    }

    #[test]
    fn test_field_value_numeric_view() {
        assert_eq!(
            FieldValue::Valid(NormalizedValue::Float(1.88)).as_numeric(),
            Some(1.88)
        );
        assert_eq!(
            FieldValue::Valid(NormalizedValue::Time("12:00:01".into())).as_numeric(),
            None
        );
        assert_eq!(
            FieldValue::Invalid {
                raw: "5".into(),
                reason: "x".into()
            }
            .as_numeric(),
            None
        );
    }

    #[test]
    fn test_record_keys_sort_by_capture_order() {
        let a = RecordKey::new("2026-01-05 10.00.01");
        let b = RecordKey::new("2026-01-05 10.00.02");
        assert!(a < b);
    }

    #[test]
    fn test_field_center_display() {
        assert_eq!(FieldCenter::Median(9.128).to_string(), "9.128");
        assert_eq!(
            FieldCenter::Mode("OK".into()).to_string(),
            "most common: OK"
        );
    }

    #[test]
    fn test_field_value_serde_round_trip() {
        let v = FieldValue::Invalid {
            raw: "9,1".into(),
            reason: "not an integer".into(),
        };
        let json = serde_json::to_string(&v).unwrap();
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
