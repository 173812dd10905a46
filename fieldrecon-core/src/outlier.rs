//! Per-field statistical outlier detection.
//!
//! Scans each numeric column of a batch against its batch-level statistics
//! and emits advisory annotations. Flagged records are never removed or
//! altered; the annotations exist for downstream review and escalation
//! context.

use crate::config::{OutlierConfig, OutlierMode};
use crate::report::OutlierAnnotation;
use crate::schema::SourceSchema;
use crate::stats::FieldStatistics;
use crate::types::ObservationRecord;
use tracing::debug;

/// Statistical anomaly scanner with a configurable detection mode.
pub struct OutlierDetector {
    mode: OutlierMode,
    min_samples: usize,
}

impl OutlierDetector {
    pub fn new(config: &OutlierConfig) -> Self {
        Self {
            mode: config.mode.clone(),
            min_samples: config.min_samples,
        }
    }

    /// Scan every numeric field of the batch.
    ///
    /// Columns whose statistics were built from fewer than `min_samples`
    /// positive non-zero values have no summary and are skipped entirely.
    /// Values of exactly 0 are idle/defect markers and are never flagged.
    pub fn scan(
        &self,
        records: &[ObservationRecord],
        schema: &SourceSchema,
        stats: &FieldStatistics,
    ) -> Vec<OutlierAnnotation> {
        let mut annotations = Vec::new();

        for spec in schema.numeric_fields() {
            let Some(summary) = stats.numeric_summary(&spec.id) else {
                continue;
            };
            if summary.sample_count < self.min_samples || summary.median == 0.0 {
                continue;
            }

            for record in records {
                let Some(value) = record.field(&spec.id).and_then(|v| v.as_numeric()) else {
                    continue;
                };
                if value == 0.0 {
                    continue;
                }
                if let Some(score) = self.score(value, summary.median, summary.mean, summary.std_dev)
                {
                    annotations.push(OutlierAnnotation {
                        key: record.key.clone(),
                        field_id: spec.id.clone(),
                        value,
                        score,
                        reason: "statistical outlier".to_string(),
                    });
                }
            }
        }

        debug!(flagged = annotations.len(), "outlier scan complete");
        annotations
    }

    /// Score a single value; `Some(score)` when it trips the active mode.
    fn score(&self, value: f64, median: f64, mean: f64, std_dev: f64) -> Option<f64> {
        match self.mode {
            OutlierMode::Ratio { threshold } => {
                let ratio = value / median;
                (ratio > threshold || ratio < 1.0 / threshold).then_some(ratio)
            }
            OutlierMode::ZScore { threshold } => {
                if std_dev < f64::EPSILON {
                    return None;
                }
                let z = (value - mean).abs() / std_dev;
                (z > threshold).then_some(z)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};
    use crate::types::{FieldValue, NormalizedValue};
    use chrono::Utc;

    fn schema() -> SourceSchema {
        SourceSchema::new(
            "test",
            "N1",
            vec![FieldSpec::new("N1", FieldType::Float)],
            0..1,
        )
    }

    fn batch(values: &[f64]) -> Vec<ObservationRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut r = ObservationRecord::new(format!("k{i:03}"), Utc::now(), "12:00:00");
                r.set_field("N1", FieldValue::Valid(NormalizedValue::Float(*v)));
                r
            })
            .collect()
    }

    fn scan(values: &[f64], config: &OutlierConfig) -> Vec<OutlierAnnotation> {
        let records = batch(values);
        let stats = FieldStatistics::collect(&records, &schema(), config.min_samples);
        OutlierDetector::new(config).scan(&records, &schema(), &stats)
    }

    #[test]
    fn test_ratio_mode_flags_extreme_value() {
        // median of [10,10,11,9,1000,10] excluding nothing (all non-zero) is 10
        let flagged = scan(&[10.0, 10.0, 11.0, 9.0, 1000.0, 10.0], &OutlierConfig::default());
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].key, "k004".into());
        assert_eq!(flagged[0].value, 1000.0);
        assert_eq!(flagged[0].score, 100.0);
        assert_eq!(flagged[0].reason, "statistical outlier");
    }

    #[test]
    fn test_ratio_mode_flags_tiny_value() {
        let flagged = scan(&[10.0, 10.0, 11.0, 9.0, 1.0, 10.0], &OutlierConfig::default());
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].value, 1.0);
    }

    #[test]
    fn test_zero_never_flagged_and_never_counted() {
        // zeros neither shift the median nor get flagged themselves
        let flagged = scan(
            &[10.0, 10.0, 11.0, 9.0, 0.0, 10.0, 0.0],
            &OutlierConfig::default(),
        );
        assert!(flagged.is_empty());
    }

    #[test]
    fn test_below_min_samples_skips_column() {
        let flagged = scan(&[10.0, 1000.0, 10.0], &OutlierConfig::default());
        assert!(flagged.is_empty());
    }

    #[test]
    fn test_zscore_mode() {
        let config = OutlierConfig {
            mode: OutlierMode::ZScore { threshold: 2.0 },
            min_samples: 5,
        };
        let mut values = vec![100.0; 10];
        values.push(100.5); // slight wobble so std_dev is non-zero
        values.push(200.0);
        let flagged = scan(&values, &config);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].value, 200.0);
    }

    #[test]
    fn test_near_median_values_not_flagged() {
        let flagged = scan(&[10.0, 10.0, 11.0, 9.0, 10.0, 12.0], &OutlierConfig::default());
        assert!(flagged.is_empty());
    }
}
