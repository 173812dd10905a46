//! Fuzzy redundancy detection and device-clock phase labeling.
//!
//! A single sequential pass over the (key-ordered) batch compares each
//! record's fingerprint against both neighbors, raises conflict cases for
//! the positions where fuzzy-matched pairs disagree, and tracks how long
//! the device clock has been stalled.

use crate::escalate::EvidenceProvider;
use crate::schema::SourceSchema;
use crate::stats::FieldStatistics;
use crate::types::{
    ConflictCase, ObservationRecord, RecordLabels, RedundancyLabel, TimePhase, TimeState,
};
use tracing::debug;

/// Canonical comparable projection of a record: one string per field in the
/// schema's comparable range, in schema order. Missing fields project to
/// the empty string.
pub fn fingerprint(record: &ObservationRecord, schema: &SourceSchema) -> Vec<String> {
    schema
        .comparable_fields()
        .iter()
        .map(|spec| {
            record
                .field(&spec.id)
                .map(|v| v.canonical())
                .unwrap_or_default()
        })
        .collect()
}

/// Positional similarity of two fingerprints: matching positions over
/// length. Length mismatches score 0.0; two empty fingerprints are
/// vacuously identical.
pub fn similarity(a: &[String], b: &[String]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    if a.is_empty() {
        return 1.0;
    }
    let matching = a.iter().zip(b).filter(|(x, y)| x == y).count();
    matching as f64 / a.len() as f64
}

/// Result of the labeling pass.
#[derive(Debug, Default)]
pub struct LabelOutcome {
    /// One label per input record, in input order.
    pub labels: Vec<RecordLabels>,
    /// Conflict cases raised by fuzzy-matched but non-identical pairs.
    pub conflicts: Vec<ConflictCase>,
}

/// Labels each record of a batch with redundancy links and time state.
pub struct SimilarityMatcher {
    threshold: f64,
    frozen_threshold_secs: f64,
}

impl SimilarityMatcher {
    pub fn new(threshold: f64, frozen_threshold_secs: f64) -> Self {
        Self {
            threshold,
            frozen_threshold_secs,
        }
    }

    /// Label the batch in one sequential pass.
    ///
    /// Redundancy links are symmetric: whenever a pair scores at or above
    /// the threshold, the earlier record gets `redundant_with_next` and the
    /// later one `redundant_with_prev`. Every differing position of such a
    /// pair raises one conflict case, attributed to the later record.
    ///
    /// Time state follows the device clock: the phase resets to `New` when
    /// the clock string advances, stays `Static` while it repeats, and
    /// turns `Frozen` once the stall reaches the frozen threshold.
    pub fn label(
        &self,
        records: &[ObservationRecord],
        schema: &SourceSchema,
        stats: &FieldStatistics,
        evidence: &dyn EvidenceProvider,
    ) -> LabelOutcome {
        let fingerprints: Vec<Vec<String>> = records
            .iter()
            .map(|r| fingerprint(r, schema))
            .collect();

        let mut labels: Vec<RecordLabels> = Vec::with_capacity(records.len());
        let mut conflicts = Vec::new();
        let mut state_start = None;

        for (i, record) in records.iter().enumerate() {
            let mut redundancy = RedundancyLabel::default();

            if i > 0 {
                let score = similarity(&fingerprints[i], &fingerprints[i - 1]);
                redundancy.similarity_prev = score;
                if score >= self.threshold {
                    redundancy.redundant_with_prev = true;
                    redundancy.matched_keys.push(records[i - 1].key.clone());
                    let prev = &mut labels[i - 1];
                    prev.redundancy.redundant_with_next = true;
                    prev.redundancy.similarity_next = score;
                    prev.redundancy.matched_keys.push(record.key.clone());
                    if score < 1.0 {
                        self.raise_conflicts(
                            record,
                            &records[i - 1],
                            &fingerprints[i],
                            &fingerprints[i - 1],
                            score,
                            schema,
                            stats,
                            evidence,
                            &mut conflicts,
                        );
                    }
                } else {
                    labels[i - 1].redundancy.similarity_next = score;
                }
            }

            let time_state = match state_start {
                Some(start) if record.device_time == records[i - 1].device_time => {
                    let duration = seconds_between(start, record.capture_time);
                    let phase = if duration >= self.frozen_threshold_secs {
                        TimePhase::Frozen
                    } else {
                        TimePhase::Static
                    };
                    TimeState {
                        phase,
                        duration_since_state_start: duration,
                    }
                }
                _ => {
                    state_start = Some(record.capture_time);
                    TimeState::new_state()
                }
            };

            labels.push(RecordLabels {
                redundancy,
                time_state,
            });
        }

        debug!(
            records = records.len(),
            conflicts = conflicts.len(),
            "labeling pass complete"
        );
        LabelOutcome { labels, conflicts }
    }

    #[allow(clippy::too_many_arguments)]
    fn raise_conflicts(
        &self,
        current: &ObservationRecord,
        compared: &ObservationRecord,
        current_fp: &[String],
        compared_fp: &[String],
        score: f64,
        schema: &SourceSchema,
        stats: &FieldStatistics,
        evidence: &dyn EvidenceProvider,
        conflicts: &mut Vec<ConflictCase>,
    ) {
        let specs = schema.comparable_fields();
        for (pos, (cur, cmp)) in current_fp.iter().zip(compared_fp).enumerate() {
            if cur == cmp {
                continue;
            }
            let spec = &specs[pos];
            conflicts.push(ConflictCase {
                field_id: spec.id.clone(),
                field_type: spec.field_type,
                current_key: current.key.clone(),
                compared_key: compared.key.clone(),
                current_value: cur.clone(),
                compared_value: cmp.clone(),
                evidence_current: evidence.evidence_for(&current.key, &spec.id),
                evidence_compared: evidence.evidence_for(&compared.key, &spec.id),
                contextual_median: stats.center(&spec.id),
                similarity: score,
            });
        }
    }
}

fn seconds_between(
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}
