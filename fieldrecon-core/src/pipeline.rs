//! The reconciliation pipeline: one batch in, one consolidated output out.
//!
//! Stage order per batch: structural preconditions, validation, statistics,
//! outlier scan, redundancy/time labeling, oracle escalation with symmetric
//! patching, chain consolidation. Structural failures are fatal for the
//! offending batch only and never produce partial output.

use crate::audit::EventAuditor;
use crate::config::ReconConfig;
use crate::consolidate::ChainConsolidator;
use crate::error::{ConfigError, FieldReconError, Result, StructuralError};
use crate::escalate::{ConflictEscalator, EvidenceProvider, Oracle};
use crate::outlier::OutlierDetector;
use crate::report::BatchOutput;
use crate::schema::{FieldId, SchemaRegistry, SourceSchema};
use crate::similarity::SimilarityMatcher;
use crate::stats::FieldStatistics;
use crate::types::ObservationRecord;
use crate::validate::FieldValidator;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a multi-batch run. Failed batches are reported alongside the
/// successful ones; one bad batch never poisons the rest.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub batches: Vec<BatchOutput>,
    /// Failed batches as (source id, error) pairs. Records that matched no
    /// registered schema fail under the source id `"unmatched"`.
    pub failures: Vec<(String, FieldReconError)>,
}

/// Drives a batch of observations through every reconciliation stage.
pub struct Pipeline {
    config: ReconConfig,
    registry: SchemaRegistry,
    validator: FieldValidator,
    auditor: EventAuditor,
    oracle: Arc<dyn Oracle>,
    evidence: Arc<dyn EvidenceProvider>,
}

impl Pipeline {
    pub fn new(
        config: ReconConfig,
        registry: SchemaRegistry,
        oracle: Arc<dyn Oracle>,
        evidence: Arc<dyn EvidenceProvider>,
    ) -> Self {
        let validator = FieldValidator::new(&config.validation);
        let auditor = EventAuditor::new(&config.validation);
        Self {
            config,
            registry,
            validator,
            auditor,
            oracle,
            evidence,
        }
    }

    /// Process one batch end to end.
    ///
    /// The batch must already be in capture order; order is asserted, not
    /// imposed. Any structural violation aborts the whole batch before the
    /// first stage runs.
    pub async fn run_batch(&self, mut records: Vec<ObservationRecord>) -> Result<BatchOutput> {
        let schema = self.resolve_schema(&records)?;
        self.check_preconditions(&records, schema)?;
        info!(
            source = %schema.source_id,
            records = records.len(),
            "batch accepted"
        );

        let abnormal_fields = self.validator.validate_batch(&mut records, schema);

        let stats = FieldStatistics::collect(&records, schema, self.config.outlier.min_samples);
        let outliers =
            OutlierDetector::new(&self.config.outlier).scan(&records, schema, &stats);

        let matcher = SimilarityMatcher::new(
            self.config.similarity.threshold_for(&schema.source_id),
            self.config.time_state.frozen_threshold_secs,
        );
        let mut outcome = matcher.label(&records, schema, &stats, self.evidence.as_ref());

        let escalator = ConflictEscalator::new(self.oracle.clone(), &self.config.escalation);
        let verdicts = escalator
            .escalate_all(std::mem::take(&mut outcome.conflicts))
            .await;
        let patched =
            escalator.apply_patches(&mut records, schema, &self.validator, &verdicts);

        if patched > 0 {
            // Patched pairs now fingerprint closer than they did, so the
            // redundancy links need refreshing before consolidation. One
            // escalation round per batch: conflicts surfacing only now wait
            // for the next run.
            debug!(patched, "relabeling after escalation patches");
            outcome = matcher.label(&records, schema, &stats, self.evidence.as_ref());
        }

        let consolidation =
            ChainConsolidator.consolidate(&records, &outcome.labels, schema, &stats);

        let audit = self.auditor.audit(&consolidation.events, schema, &stats);

        info!(
            source = %schema.source_id,
            records = records.len(),
            events = consolidation.events.len(),
            abnormal = abnormal_fields.len(),
            unresolved = verdicts.unresolved(),
            audit_issues = audit.issues.len(),
            "batch complete"
        );

        Ok(BatchOutput {
            source_id: schema.source_id.clone(),
            processed_at: Utc::now(),
            record_count: records.len(),
            events: consolidation.events,
            abnormal_fields,
            outliers,
            verdicts,
            consolidation_log: consolidation.log,
            audit,
        })
    }

    /// Group records by the schema they match and process each group as an
    /// independent batch. Relative record order is preserved within groups.
    pub async fn run_all(&self, records: Vec<ObservationRecord>) -> RunOutcome {
        let mut groups: Vec<(String, Vec<ObservationRecord>)> = Vec::new();
        let mut unmatched = 0usize;

        for record in records {
            let present: HashSet<FieldId> = record.fields.keys().cloned().collect();
            let Some(schema) = self.registry.resolve(&present) else {
                unmatched += 1;
                continue;
            };
            match groups.iter_mut().find(|(id, _)| id == &schema.source_id) {
                Some((_, batch)) => batch.push(record),
                None => groups.push((schema.source_id.clone(), vec![record])),
            }
        }

        let mut outcome = RunOutcome::default();
        if unmatched > 0 {
            warn!(unmatched, "records matched no registered schema");
            outcome.failures.push((
                "unmatched".to_string(),
                StructuralError::UnknownSchema {
                    candidates: self.registry.len(),
                }
                .into(),
            ));
        }

        for (source_id, batch) in groups {
            match self.run_batch(batch).await {
                Ok(output) => outcome.batches.push(output),
                Err(e) => {
                    warn!(source = %source_id, error = %e, "batch failed");
                    outcome.failures.push((source_id, e));
                }
            }
        }

        outcome
    }

    fn resolve_schema(&self, records: &[ObservationRecord]) -> Result<&SourceSchema> {
        let first = records.first().ok_or(StructuralError::EmptyBatch {
            source_id: "unknown".to_string(),
        })?;
        let present: HashSet<FieldId> = first.fields.keys().cloned().collect();
        self.registry
            .resolve(&present)
            .ok_or_else(|| {
                StructuralError::UnknownSchema {
                    candidates: self.registry.len(),
                }
                .into()
            })
    }

    fn check_preconditions(
        &self,
        records: &[ObservationRecord],
        schema: &SourceSchema,
    ) -> Result<()> {
        if !schema.comparable_range_fits() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "schema '{}' comparable range {:?} does not fit its {} fields",
                    schema.source_id,
                    schema.comparable_range,
                    schema.fields.len()
                ),
            }
            .into());
        }

        let known: HashSet<&FieldId> = schema.fields.iter().map(|f| &f.id).collect();

        for (i, record) in records.iter().enumerate() {
            if record.device_time.trim().is_empty() {
                return Err(StructuralError::MissingDeviceTime {
                    key: record.key.to_string(),
                    field: "device_time".to_string(),
                }
                .into());
            }
            for field in record.fields.keys() {
                if !known.contains(field) {
                    return Err(StructuralError::UnknownField {
                        key: record.key.to_string(),
                        field: field.to_string(),
                    }
                    .into());
                }
            }
            if i > 0 {
                let prev = &records[i - 1];
                if record.key == prev.key {
                    return Err(StructuralError::DuplicateKey {
                        key: record.key.to_string(),
                    }
                    .into());
                }
                if record.key < prev.key {
                    return Err(StructuralError::KeysOutOfOrder {
                        previous: prev.key.to_string(),
                        current: record.key.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalate::{NoEvidence, ScriptedOracle};
    use crate::schema::{FieldSpec, FieldType};
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn latch_schema() -> SourceSchema {
        SourceSchema::new(
            "latch",
            "F12",
            vec![
                FieldSpec::new("F12", FieldType::Status),
                FieldSpec::new("F13", FieldType::Integer),
                FieldSpec::new("F16", FieldType::Float),
            ],
            0..3,
        )
    }

    fn pipeline() -> Pipeline {
        let mut registry = SchemaRegistry::new();
        registry.register(latch_schema());
        Pipeline::new(
            ReconConfig::default(),
            registry,
            Arc::new(ScriptedOracle::confirming()),
            Arc::new(NoEvidence),
        )
    }

    fn record(key: &str, secs: i64, device_time: &str, raw: [&str; 3]) -> ObservationRecord {
        let base = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let mut r = ObservationRecord::new(key, base + Duration::seconds(secs), device_time);
        r.set_raw("F12", raw[0]);
        r.set_raw("F13", raw[1]);
        r.set_raw("F16", raw[2]);
        r
    }

    #[tokio::test]
    async fn test_empty_batch_is_structural_error() {
        let err = pipeline().run_batch(vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            FieldReconError::Structural(StructuralError::EmptyBatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_schema_is_structural_error() {
        let mut r = record("k1", 0, "08:00:00", ["OK", "97", "1.88"]);
        r.fields.remove(&FieldId::from("F12"));
        let err = pipeline().run_batch(vec![r]).await.unwrap_err();
        assert!(matches!(
            err,
            FieldReconError::Structural(StructuralError::UnknownSchema { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_device_time_is_structural_error() {
        let r = record("k1", 0, "  ", ["OK", "97", "1.88"]);
        let err = pipeline().run_batch(vec![r]).await.unwrap_err();
        assert!(matches!(
            err,
            FieldReconError::Structural(StructuralError::MissingDeviceTime { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_keys_are_rejected() {
        let batch = vec![
            record("k2", 0, "08:00:00", ["OK", "97", "1.88"]),
            record("k1", 1, "08:00:01", ["OK", "97", "1.88"]),
        ];
        let err = pipeline().run_batch(batch).await.unwrap_err();
        assert!(matches!(
            err,
            FieldReconError::Structural(StructuralError::KeysOutOfOrder { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_rejected() {
        let batch = vec![
            record("k1", 0, "08:00:00", ["OK", "97", "1.88"]),
            record("k1", 1, "08:00:01", ["OK", "97", "1.88"]),
        ];
        let err = pipeline().run_batch(batch).await.unwrap_err();
        assert!(matches!(
            err,
            FieldReconError::Structural(StructuralError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_field_is_rejected() {
        let mut r = record("k1", 0, "08:00:00", ["OK", "97", "1.88"]);
        r.set_raw("F99", "5");
        let err = pipeline().run_batch(vec![r]).await.unwrap_err();
        assert!(matches!(
            err,
            FieldReconError::Structural(StructuralError::UnknownField { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_comparable_range_is_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register(SourceSchema::new(
            "narrow",
            "F40",
            vec![FieldSpec::new("F40", FieldType::Integer)],
            0..5,
        ));
        let pipeline = Pipeline::new(
            ReconConfig::default(),
            registry,
            Arc::new(ScriptedOracle::confirming()),
            Arc::new(NoEvidence),
        );

        let base = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let mut r = ObservationRecord::new("k1", base, "08:00:00");
        r.set_raw("F40", "12");

        // a misconfigured schema fails the batch instead of panicking
        let err = pipeline.run_batch(vec![r]).await.unwrap_err();
        assert!(matches!(
            err,
            FieldReconError::Config(ConfigError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_identical_run_folds_to_one_event() {
        let batch: Vec<ObservationRecord> = (0..6)
            .map(|i| record(&format!("k{i}"), i, "08:00:00", ["OK", "97", "1.88"]))
            .collect();
        let output = pipeline().run_batch(batch).await.unwrap();

        assert_eq!(output.record_count, 6);
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].chain_size, 6);
        assert_eq!(output.consolidation_log.len(), 5);
        assert!(output.abnormal_fields.is_empty());
        assert!(output.outliers.is_empty());
        assert!(output.verdicts.is_empty());
        assert!(output.audit.is_clean());
    }

    #[tokio::test]
    async fn test_state_change_splits_events() {
        let mut batch: Vec<ObservationRecord> = (0..3)
            .map(|i| record(&format!("k{i}"), i, "08:00:00", ["OK", "97", "1.88"]))
            .collect();
        batch.push(record("k3", 12, "08:00:12", ["NG", "45", "2.05"]));
        let output = pipeline().run_batch(batch).await.unwrap();

        assert_eq!(output.events.len(), 2);
        assert_eq!(output.events[1].real_freeze_duration_secs, 12.0);
    }

    #[tokio::test]
    async fn test_run_all_isolates_failed_batches() {
        let mut registry = SchemaRegistry::new();
        registry.register(latch_schema());
        registry.register(SourceSchema::new(
            "nozzle",
            "F40",
            vec![FieldSpec::new("F40", FieldType::Integer)],
            0..1,
        ));
        let pipeline = Pipeline::new(
            ReconConfig::default(),
            registry,
            Arc::new(ScriptedOracle::confirming()),
            Arc::new(NoEvidence),
        );

        let base = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let mut nozzle_bad = ObservationRecord::new("n1", base, ""); // no device time
        nozzle_bad.set_raw("F40", "12");

        let all = vec![
            record("k1", 0, "08:00:00", ["OK", "97", "1.88"]),
            record("k2", 1, "08:00:01", ["OK", "97", "1.88"]),
            nozzle_bad,
        ];

        let outcome = pipeline.run_all(all).await;
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].source_id, "latch");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "nozzle");
    }

    #[tokio::test]
    async fn test_run_all_reports_unmatched_records() {
        let mut r = record("k1", 0, "08:00:00", ["OK", "97", "1.88"]);
        r.fields.remove(&FieldId::from("F12"));
        let outcome = pipeline().run_all(vec![r]).await;
        assert!(outcome.batches.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "unmatched");
    }
}
