//! Oracle-mediated conflict escalation.
//!
//! The oracle is an injected capability (in production, a vision-language
//! model reading the original evidence crops). The escalator dispatches
//! each conflict case exactly once, under a bounded concurrency limit, and
//! degrades every failure to an `Unresolved` verdict instead of aborting
//! the batch.

use crate::config::EscalationConfig;
use crate::error::OracleError;
use crate::report::{VerdictRecord, VerdictReport};
use crate::schema::{FieldId, FieldType, SourceSchema};
use crate::types::{
    ConflictCase, EvidenceHandle, FieldCenter, ObservationRecord, RecordKey, Verdict,
};
use crate::validate::FieldValidator;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Everything the oracle gets to see for one disputed field.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub field_type: FieldType,
    pub current_value: String,
    pub compared_value: String,
    pub evidence_current: EvidenceHandle,
    pub evidence_compared: EvidenceHandle,
    /// Batch-level center of the disputed field, for sanity checking.
    pub median_context: Option<FieldCenter>,
}

/// External arbiter for disputed field values.
///
/// Implementations are expected to be expensive and rate-limited; the
/// escalator bounds concurrency and never retries.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Propose the true value for a disputed field, or fail with an
    /// `OracleError` (which the escalator records as `Unresolved`).
    async fn resolve(&self, request: OracleRequest) -> Result<String, OracleError>;
}

/// Maps (record key, field id) to reader-supplied evidence backing that
/// reading. Supplied by the upstream reader subsystem.
pub trait EvidenceProvider: Send + Sync {
    fn evidence_for(&self, key: &RecordKey, field: &FieldId) -> Option<EvidenceHandle>;
}

/// An evidence provider with nothing to offer. Every case escalated with
/// it comes back `Unresolved`.
pub struct NoEvidence;

impl EvidenceProvider for NoEvidence {
    fn evidence_for(&self, _key: &RecordKey, _field: &FieldId) -> Option<EvidenceHandle> {
        None
    }
}

/// Evidence provider backed by a static map, keyed by
/// `(record key, field id)`.
#[derive(Default)]
pub struct StaticEvidence {
    handles: HashMap<(RecordKey, FieldId), EvidenceHandle>,
}

impl StaticEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register evidence for every field of every given record key, using
    /// `<key>/<field>` as the handle. Convenient for tests and replay.
    pub fn covering<'a>(
        keys: impl IntoIterator<Item = &'a RecordKey>,
        fields: impl IntoIterator<Item = &'a FieldId> + Clone,
    ) -> Self {
        let mut provider = Self::new();
        for key in keys {
            for field in fields.clone() {
                provider.insert(
                    key.clone(),
                    field.clone(),
                    EvidenceHandle::new(format!("{key}/{field}")),
                );
            }
        }
        provider
    }

    pub fn insert(&mut self, key: RecordKey, field: FieldId, handle: EvidenceHandle) {
        self.handles.insert((key, field), handle);
    }
}

impl EvidenceProvider for StaticEvidence {
    fn evidence_for(&self, key: &RecordKey, field: &FieldId) -> Option<EvidenceHandle> {
        self.handles.get(&(key.clone(), field.clone())).cloned()
    }
}

/// Resolves conflict cases through the injected oracle and applies the
/// resulting patches symmetrically.
pub struct ConflictEscalator {
    oracle: Arc<dyn Oracle>,
    max_concurrent: usize,
    timeout_secs: u64,
    median_tolerance: f64,
}

impl ConflictEscalator {
    pub fn new(oracle: Arc<dyn Oracle>, config: &EscalationConfig) -> Self {
        Self {
            oracle,
            max_concurrent: config.max_concurrent.max(1),
            timeout_secs: config.timeout_secs,
            median_tolerance: config.median_tolerance,
        }
    }

    /// Escalate every case concurrently, bounded by `max_concurrent`.
    /// Output order matches input order regardless of completion order.
    /// One attempt per case; failures become `Unresolved` verdicts.
    pub async fn escalate_all(&self, cases: Vec<ConflictCase>) -> VerdictReport {
        if cases.is_empty() {
            return VerdictReport::default();
        }

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(cases.len());

        for case in cases {
            let oracle = self.oracle.clone();
            let sem = semaphore.clone();
            let timeout_secs = self.timeout_secs;
            let median_tolerance = self.median_tolerance;

            handles.push(tokio::spawn(async move {
                // Semaphore closes only on drop, which cannot happen while
                // this task holds a clone.
                let _permit = sem.acquire().await.expect("semaphore closed");
                escalate_one(oracle.as_ref(), case, timeout_secs, median_tolerance).await
            }));
        }

        let mut records = Vec::with_capacity(handles.len());
        for outcome in join_all(handles).await {
            match outcome {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "escalation task panicked"),
            }
        }

        let report = VerdictReport { records };
        debug!(
            total = report.records.len(),
            unresolved = report.unresolved(),
            "escalation complete"
        );
        report
    }

    /// Apply resolved verdicts to the record batch.
    ///
    /// Patch symmetry is mandatory: both participating records are asserted
    /// to represent one real-world state, so the resolved value is written
    /// to both sides, re-validated through the normal rules. Unresolved
    /// cases leave both records untouched.
    pub fn apply_patches(
        &self,
        records: &mut [ObservationRecord],
        schema: &SourceSchema,
        validator: &FieldValidator,
        report: &VerdictReport,
    ) -> usize {
        let mut patched = 0;
        for verdict in &report.records {
            if verdict.verdict == Verdict::Unresolved {
                continue;
            }
            let Some(proposed) = verdict.proposed.as_deref() else {
                continue;
            };
            let Some(field_type) = schema.field_type(&verdict.field_id) else {
                continue;
            };
            let value = validator.validate(proposed, field_type);
            for key in [&verdict.current_key, &verdict.compared_key] {
                if let Some(record) = records.iter_mut().find(|r| &r.key == key) {
                    record.set_field(verdict.field_id.clone(), value.clone());
                    patched += 1;
                }
            }
        }
        debug!(patched, "applied escalation patches");
        patched
    }
}

/// Resolve one case: missing evidence short-circuits to Unresolved without
/// spending an oracle call.
async fn escalate_one(
    oracle: &dyn Oracle,
    case: ConflictCase,
    timeout_secs: u64,
    median_tolerance: f64,
) -> VerdictRecord {
    let (Some(evidence_current), Some(evidence_compared)) =
        (case.evidence_current.clone(), case.evidence_compared.clone())
    else {
        return unresolved(&case, "evidence missing");
    };

    let request = OracleRequest {
        field_type: case.field_type,
        current_value: case.current_value.clone(),
        compared_value: case.compared_value.clone(),
        evidence_current,
        evidence_compared,
        median_context: case.contextual_median.clone(),
    };

    let outcome = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        oracle.resolve(request),
    )
    .await;

    match outcome {
        Ok(Ok(proposed)) => judge(&case, proposed, median_tolerance),
        Ok(Err(e)) => unresolved(&case, &e.to_string()),
        Err(_) => unresolved(
            &case,
            &OracleError::Timeout { timeout_secs }.to_string(),
        ),
    }
}

/// Classify an oracle answer against the two disputed readings.
fn judge(case: &ConflictCase, proposed: String, median_tolerance: f64) -> VerdictRecord {
    let ai = normalize(&proposed);
    let (verdict, note) = if ai == normalize(&case.compared_value) {
        (Verdict::ConfirmedRedundant, None)
    } else if ai == normalize(&case.current_value) {
        (Verdict::GenuineChange, None)
    } else {
        (Verdict::NewValue, median_note(case, &ai, median_tolerance))
    };

    VerdictRecord {
        field_id: case.field_id.clone(),
        current_key: case.current_key.clone(),
        compared_key: case.compared_key.clone(),
        current_value: case.current_value.clone(),
        compared_value: case.compared_value.clone(),
        proposed: Some(proposed),
        verdict,
        similarity: case.similarity,
        median_context: case.contextual_median.clone(),
        note,
    }
}

/// For NewValue verdicts on numeric fields, note how the proposed value
/// sits relative to the batch median.
fn median_note(case: &ConflictCase, proposed: &str, tolerance: f64) -> Option<String> {
    let FieldCenter::Median(median) = case.contextual_median.as_ref()? else {
        return None;
    };
    if *median == 0.0 {
        return None;
    }
    let proposed_num: f64 = proposed.parse().ok()?;
    if ((proposed_num - median) / median).abs() < tolerance {
        return Some("close to median".to_string());
    }
    let prev_dist = relative_distance(&case.compared_value, *median);
    let curr_dist = relative_distance(&case.current_value, *median);
    match (prev_dist, curr_dist) {
        (Some(p), Some(c)) if p < c => Some("compared value closer to median".to_string()),
        (Some(_), Some(_)) => Some("current value closer to median".to_string()),
        _ => None,
    }
}

fn relative_distance(raw: &str, median: f64) -> Option<f64> {
    raw.trim().parse::<f64>().ok().map(|v| ((v - median) / median).abs())
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn unresolved(case: &ConflictCase, reason: &str) -> VerdictRecord {
    VerdictRecord {
        field_id: case.field_id.clone(),
        current_key: case.current_key.clone(),
        compared_key: case.compared_key.clone(),
        current_value: case.current_value.clone(),
        compared_value: case.compared_value.clone(),
        proposed: None,
        verdict: Verdict::Unresolved,
        similarity: case.similarity,
        median_context: case.contextual_median.clone(),
        note: Some(reason.to_string()),
    }
}

/// A deterministic oracle for testing and replay.
///
/// Answers are looked up by `(compared_value, current_value)` pair; pairs
/// without a scripted answer fall back to the configured default behavior.
pub struct ScriptedOracle {
    answers: Mutex<HashMap<(String, String), String>>,
    fallback: Fallback,
}

enum Fallback {
    /// Echo the compared (earlier) reading — confirms redundancy.
    CompareValue,
    /// Always answer with a fixed value.
    Fixed(String),
    /// Always fail as unavailable.
    Unavailable,
}

impl ScriptedOracle {
    /// Oracle that confirms every dispute as redundant (answers with the
    /// compared value).
    pub fn confirming() -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            fallback: Fallback::CompareValue,
        }
    }

    /// Oracle that always proposes the same value.
    pub fn always(value: impl Into<String>) -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            fallback: Fallback::Fixed(value.into()),
        }
    }

    /// Oracle that is never available.
    pub fn unavailable() -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            fallback: Fallback::Unavailable,
        }
    }

    /// Script an answer for a specific (compared, current) dispute.
    pub fn script(
        &self,
        compared: impl Into<String>,
        current: impl Into<String>,
        answer: impl Into<String>,
    ) {
        self.answers
            .lock()
            .unwrap()
            .insert((compared.into(), current.into()), answer.into());
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn resolve(&self, request: OracleRequest) -> Result<String, OracleError> {
        let key = (request.compared_value.clone(), request.current_value.clone());
        if let Some(answer) = self.answers.lock().unwrap().get(&key) {
            return Ok(answer.clone());
        }
        match &self.fallback {
            Fallback::CompareValue => Ok(request.compared_value),
            Fallback::Fixed(value) => Ok(value.clone()),
            Fallback::Unavailable => Err(OracleError::Unavailable {
                reason: "scripted as unavailable".to_string(),
            }),
        }
    }
}
