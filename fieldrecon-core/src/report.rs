//! Audit-trail report types emitted alongside the consolidated events.
//!
//! Every stage that flags, resolves, or folds a record leaves a trace here;
//! nothing is dropped silently.

use crate::audit::AuditReport;
use crate::schema::FieldId;
use crate::types::{FieldCenter, RecordKey, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One field that failed validation. The raw reading is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbnormalField {
    pub key: RecordKey,
    pub field_id: FieldId,
    pub raw_value: String,
    pub reason: String,
}

/// Advisory annotation for a statistically anomalous value. Flagged records
/// are never removed or altered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierAnnotation {
    pub key: RecordKey,
    pub field_id: FieldId,
    pub value: f64,
    /// The value/median ratio (ratio mode) or z-score (z-score mode) that
    /// triggered the flag.
    pub score: f64,
    pub reason: String,
}

/// Escalation outcome for one conflict case, as recorded in the verdict
/// report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub field_id: FieldId,
    pub current_key: RecordKey,
    pub compared_key: RecordKey,
    pub current_value: String,
    pub compared_value: String,
    /// Value the oracle proposed, when it answered at all.
    pub proposed: Option<String>,
    pub verdict: Verdict,
    /// Similarity score of the pair that raised the case.
    pub similarity: f64,
    pub median_context: Option<FieldCenter>,
    /// Free-form note: median-closeness for NewValue verdicts, failure
    /// reason for Unresolved ones.
    pub note: Option<String>,
}

/// All escalation outcomes for one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerdictReport {
    pub records: Vec<VerdictRecord>,
}

impl VerdictReport {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.records.iter().filter(|r| r.verdict == verdict).count()
    }

    pub fn unresolved(&self) -> usize {
        self.count(Verdict::Unresolved)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One record folded away during consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionEntry {
    pub deleted_key: RecordKey,
    /// Key of the record retained in the deleted record's place.
    pub kept_key: RecordKey,
    pub reason: String,
}

/// Everything the pipeline emits for one successfully processed batch.
/// Produced only after all stages succeed; a mid-batch structural failure
/// discards the whole batch instead of emitting a truncated result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutput {
    pub source_id: String,
    /// When this batch finished processing.
    pub processed_at: DateTime<Utc>,
    pub record_count: usize,
    pub events: Vec<crate::types::Event>,
    pub abnormal_fields: Vec<AbnormalField>,
    pub outliers: Vec<OutlierAnnotation>,
    pub verdicts: VerdictReport,
    pub consolidation_log: Vec<DeletionEntry>,
    /// Quality scan of the emitted events, run as the final stage.
    pub audit: AuditReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_report_counts() {
        let mut report = VerdictReport::default();
        for verdict in [
            Verdict::ConfirmedRedundant,
            Verdict::ConfirmedRedundant,
            Verdict::Unresolved,
        ] {
            report.records.push(VerdictRecord {
                field_id: "F16".into(),
                current_key: "b".into(),
                compared_key: "a".into(),
                current_value: "1.88".into(),
                compared_value: "188".into(),
                proposed: Some("1.88".into()),
                verdict,
                similarity: 0.9,
                median_context: Some(FieldCenter::Median(1.9)),
                note: None,
            });
        }
        assert_eq!(report.count(Verdict::ConfirmedRedundant), 2);
        assert_eq!(report.unresolved(), 1);
        assert_eq!(report.count(Verdict::NewValue), 0);
    }
}
