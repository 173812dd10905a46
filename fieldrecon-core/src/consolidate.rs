//! Chain consolidation: folding runs of redundant records into events.
//!
//! A chain is a maximal run of consecutive records linked pairwise by the
//! labeling pass. Each chain collapses into one event carrying the fields
//! of its most trustworthy member; every folded record leaves a deletion
//! log entry.

use crate::report::DeletionEntry;
use crate::schema::SourceSchema;
use crate::stats::FieldStatistics;
use crate::types::{Event, ObservationRecord, RecordLabels};
use tracing::debug;

/// A maximal run of mutually-redundant consecutive records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// Indices into the batch, consecutive and in order.
    pub indices: Vec<usize>,
    /// Index (into the batch) of the member whose fields the event keeps.
    pub representative: usize,
}

/// Events plus the trail of records folded to produce them.
#[derive(Debug, Default)]
pub struct ConsolidationOutcome {
    pub events: Vec<Event>,
    pub log: Vec<DeletionEntry>,
}

/// Folds labeled batches into consolidated events.
pub struct ChainConsolidator;

impl ChainConsolidator {
    /// Consolidate a labeled batch. `records` and `labels` are parallel.
    ///
    /// Every record belongs to exactly one chain (singletons included), so
    /// no observation is dropped without a log entry naming its keeper.
    pub fn consolidate(
        &self,
        records: &[ObservationRecord],
        labels: &[RecordLabels],
        schema: &SourceSchema,
        stats: &FieldStatistics,
    ) -> ConsolidationOutcome {
        debug_assert_eq!(records.len(), labels.len());

        let mut outcome = ConsolidationOutcome::default();
        let mut prev_event_time = None;

        let mut start = 0;
        while start < records.len() {
            let mut end = start;
            while end + 1 < records.len()
                && labels[end].redundancy.redundant_with_next
                && labels[end + 1].redundancy.redundant_with_prev
            {
                end += 1;
            }

            let chain = self.build_chain(records, schema, stats, start, end);
            self.emit(records, &chain, &mut prev_event_time, &mut outcome);
            start = end + 1;
        }

        debug!(
            records = records.len(),
            events = outcome.events.len(),
            folded = outcome.log.len(),
            "consolidation complete"
        );
        outcome
    }

    /// Degenerate two-row mode: collapse exactly one adjacent redundant
    /// pair, keeping the earlier record. Records outside a pair pass
    /// through as singleton events.
    pub fn consolidate_pairwise(
        &self,
        records: &[ObservationRecord],
        labels: &[RecordLabels],
    ) -> ConsolidationOutcome {
        debug_assert_eq!(records.len(), labels.len());

        let mut outcome = ConsolidationOutcome::default();
        let mut prev_event_time = None;

        let mut i = 0;
        while i < records.len() {
            let paired = i + 1 < records.len()
                && labels[i].redundancy.redundant_with_next
                && labels[i + 1].redundancy.redundant_with_prev;
            let chain = if paired {
                Chain {
                    indices: vec![i, i + 1],
                    representative: i,
                }
            } else {
                Chain {
                    indices: vec![i],
                    representative: i,
                }
            };
            self.emit(records, &chain, &mut prev_event_time, &mut outcome);
            i += chain.indices.len();
        }

        outcome
    }

    fn build_chain(
        &self,
        records: &[ObservationRecord],
        schema: &SourceSchema,
        stats: &FieldStatistics,
        start: usize,
        end: usize,
    ) -> Chain {
        let mut representative = start;
        let mut best = deviation_score(&records[start], schema, stats);
        for i in start + 1..=end {
            let score = deviation_score(&records[i], schema, stats);
            // strict comparison keeps the earliest record on ties
            if score < best {
                best = score;
                representative = i;
            }
        }
        Chain {
            indices: (start..=end).collect(),
            representative,
        }
    }

    fn emit(
        &self,
        records: &[ObservationRecord],
        chain: &Chain,
        prev_event_time: &mut Option<chrono::DateTime<chrono::Utc>>,
        outcome: &mut ConsolidationOutcome,
    ) {
        let first = &records[chain.indices[0]];
        let last = &records[*chain.indices.last().expect("chain is never empty")];
        let keeper = &records[chain.representative];

        let real_freeze_duration_secs = match prev_event_time {
            Some(prev) => (first.capture_time - *prev).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        };
        *prev_event_time = Some(first.capture_time);

        for &i in &chain.indices {
            if i == chain.representative {
                continue;
            }
            outcome.log.push(DeletionEntry {
                deleted_key: records[i].key.clone(),
                kept_key: keeper.key.clone(),
                reason: "folded into redundancy chain".to_string(),
            });
        }

        outcome.events.push(Event {
            fields: keeper.fields.clone(),
            capture_time: first.capture_time,
            chain_size: chain.indices.len(),
            chain_start_key: first.key.clone(),
            chain_end_key: last.key.clone(),
            representative_key: keeper.key.clone(),
            real_freeze_duration_secs,
        });
    }
}

/// How far a record's numeric fields sit from the batch medians, summed as
/// relative distances. Idle/defect zeros contribute nothing, as do fields
/// with no usable median.
fn deviation_score(
    record: &ObservationRecord,
    schema: &SourceSchema,
    stats: &FieldStatistics,
) -> f64 {
    let mut score = 0.0;
    for spec in schema.numeric_fields() {
        let Some(value) = record.field(&spec.id).and_then(|v| v.as_numeric()) else {
            continue;
        };
        if value == 0.0 {
            continue;
        }
        let Some(median) = stats.median(&spec.id) else {
            continue;
        };
        if median == 0.0 {
            continue;
        }
        score += (value - median).abs() / median;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};
    use crate::types::{FieldValue, NormalizedValue, RedundancyLabel, TimeState};
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn schema() -> SourceSchema {
        SourceSchema::new(
            "test",
            "F1",
            vec![FieldSpec::new("F1", FieldType::Float)],
            0..1,
        )
    }

    fn record(key: &str, secs: i64, value: f64) -> ObservationRecord {
        let base = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let mut r = ObservationRecord::new(key, base + Duration::seconds(secs), "08:00:00");
        r.set_field("F1", FieldValue::Valid(NormalizedValue::Float(value)));
        r
    }

    fn linked(records: &[ObservationRecord], pairs: &[(usize, usize)]) -> Vec<RecordLabels> {
        let mut labels: Vec<RecordLabels> = records
            .iter()
            .map(|_| RecordLabels {
                redundancy: RedundancyLabel::default(),
                time_state: TimeState::new_state(),
            })
            .collect();
        for &(a, b) in pairs {
            labels[a].redundancy.redundant_with_next = true;
            labels[b].redundancy.redundant_with_prev = true;
        }
        labels
    }

    #[test]
    fn test_representative_minimizes_deviation() {
        // medians over [1.41, 1.02, 1.55]: median 1.41
        // deviations: |1.41-1.41|/1.41 = 0, so index 0 wins outright; use
        // values where the middle record is closest instead
        let records = vec![
            record("k1", 0, 2.0),
            record("k2", 1, 1.0),
            record("k3", 2, 3.0),
        ];
        // median of [2,1,3] is 2 -> deviations 0, 0.5, 0.5: keep k1
        let labels = linked(&records, &[(0, 1), (1, 2)]);
        let stats = FieldStatistics::collect(&records, &schema(), 1);
        let outcome = ChainConsolidator.consolidate(&records, &labels, &schema(), &stats);

        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].representative_key, "k1".into());
        assert_eq!(outcome.events[0].chain_size, 3);
        assert_eq!(outcome.events[0].chain_start_key, "k1".into());
        assert_eq!(outcome.events[0].chain_end_key, "k3".into());
    }

    #[test]
    fn test_representative_deviation_example() {
        // values chosen so relative deviations are roughly 0.41, 0.02, 0.55
        let records = vec![
            record("k1", 0, 0.59),
            record("k2", 1, 1.02),
            record("k3", 2, 1.55),
        ];
        // only the chain members matter; pin the median via extra context
        let context: Vec<ObservationRecord> = (0..5)
            .map(|i| record(&format!("c{i}"), 10 + i, 1.0))
            .collect();
        let mut all = records.clone();
        all.extend(context);
        let stats = FieldStatistics::collect(&all, &schema(), 1);
        // median of [0.59, 1.02, 1.55, 1, 1, 1, 1, 1] = 1.0
        let labels = linked(&records, &[(0, 1), (1, 2)]);
        let outcome = ChainConsolidator.consolidate(&records, &labels, &schema(), &stats);

        assert_eq!(outcome.events[0].representative_key, "k2".into());
        assert_eq!(outcome.log.len(), 2);
        let deleted: Vec<&str> = outcome.log.iter().map(|e| e.deleted_key.as_str()).collect();
        assert_eq!(deleted, vec!["k1", "k3"]);
        assert!(outcome.log.iter().all(|e| e.kept_key == "k2".into()));
    }

    #[test]
    fn test_tie_keeps_earliest() {
        let records = vec![record("k1", 0, 1.0), record("k2", 1, 1.0)];
        let labels = linked(&records, &[(0, 1)]);
        let stats = FieldStatistics::collect(&records, &schema(), 1);
        let outcome = ChainConsolidator.consolidate(&records, &labels, &schema(), &stats);

        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].representative_key, "k1".into());
    }

    #[test]
    fn test_zero_fields_contribute_no_deviation() {
        // k2's zero is an idle marker, excluded from the sum entirely: it
        // neither counts against k2 nor shifts the batch median
        let records = vec![
            record("k1", 0, 1.0),
            record("k2", 1, 0.0),
            record("k3", 2, 5.0),
        ];
        // median over non-zero values [1, 5] is 3
        let stats = FieldStatistics::collect(&records, &schema(), 1);
        assert_eq!(stats.median(&"F1".into()), Some(3.0));

        let labels = linked(&records, &[(0, 1), (1, 2)]);
        let outcome = ChainConsolidator.consolidate(&records, &labels, &schema(), &stats);

        // k1 and k3 both deviate by 2/3; k2's only field is excluded, so it
        // carries no deviation at all and wins
        assert_eq!(outcome.events[0].representative_key, "k2".into());
    }

    #[test]
    fn test_freeze_duration_measures_gap_between_events() {
        // three captures one second apart collapse into one event, then a
        // fourth arrives 12 seconds after the chain started
        let records = vec![
            record("k1", 0, 1.0),
            record("k2", 1, 1.0),
            record("k3", 2, 1.0),
            record("k4", 12, 2.0),
        ];
        let labels = linked(&records, &[(0, 1), (1, 2)]);
        let stats = FieldStatistics::collect(&records, &schema(), 1);
        let outcome = ChainConsolidator.consolidate(&records, &labels, &schema(), &stats);

        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[0].real_freeze_duration_secs, 0.0);
        // gap between retained events, not the sum of intra-chain gaps
        assert_eq!(outcome.events[1].real_freeze_duration_secs, 12.0);
    }

    #[test]
    fn test_singletons_pass_through() {
        let records = vec![record("k1", 0, 1.0), record("k2", 5, 2.0)];
        let labels = linked(&records, &[]);
        let stats = FieldStatistics::collect(&records, &schema(), 1);
        let outcome = ChainConsolidator.consolidate(&records, &labels, &schema(), &stats);

        assert_eq!(outcome.events.len(), 2);
        assert!(outcome.log.is_empty());
        assert_eq!(outcome.events[1].chain_size, 1);
        assert_eq!(outcome.events[1].real_freeze_duration_secs, 5.0);
    }

    #[test]
    fn test_pairwise_mode_keeps_earlier_of_pair() {
        let records = vec![
            record("k1", 0, 1.0),
            record("k2", 1, 1.0),
            record("k3", 2, 1.0),
        ];
        // all three linked, but pairwise mode only folds one pair at a time
        let labels = linked(&records, &[(0, 1), (1, 2)]);
        let outcome = ChainConsolidator.consolidate_pairwise(&records, &labels);

        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[0].representative_key, "k1".into());
        assert_eq!(outcome.events[0].chain_size, 2);
        assert_eq!(outcome.events[1].representative_key, "k3".into());
        assert_eq!(outcome.log.len(), 1);
        assert_eq!(outcome.log[0].deleted_key, "k2".into());
        assert_eq!(outcome.log[0].kept_key, "k1".into());
    }
}
