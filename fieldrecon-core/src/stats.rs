//! Batch-level field statistics.
//!
//! Medians, means, and modes are computed once per batch into an explicit,
//! caller-owned [`FieldStatistics`] value and passed into the stages that
//! need them (outlier scan, oracle context, deviation scoring). There is no
//! hidden module state, so replaying a batch is deterministic.
//!
//! Invariant: numeric values of exactly 0 are a legitimate idle/defect
//! marker and are excluded from every computation here.

use crate::schema::SourceSchema;
use crate::schema::{FieldId, FieldType};
use crate::types::{FieldCenter, FieldValue, ObservationRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Summary statistics for one numeric field across a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericSummary {
    pub median: f64,
    pub mean: f64,
    pub std_dev: f64,
    /// Count of positive, non-zero valid samples the summary was built from.
    pub sample_count: usize,
}

/// Per-field statistics for one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldStatistics {
    numeric: HashMap<FieldId, NumericSummary>,
    /// Most common valid value per Status field.
    modes: HashMap<FieldId, String>,
}

impl FieldStatistics {
    /// Compute statistics for every schema field across the batch.
    ///
    /// Numeric fields need at least `min_samples` positive, non-zero valid
    /// values to get a summary; fields below that stay absent. Status
    /// fields record their most common valid value.
    pub fn collect(
        records: &[ObservationRecord],
        schema: &SourceSchema,
        min_samples: usize,
    ) -> Self {
        let mut numeric = HashMap::new();
        let mut modes = HashMap::new();

        for spec in &schema.fields {
            match spec.field_type {
                FieldType::Integer | FieldType::Float => {
                    let values: Vec<f64> = records
                        .iter()
                        .filter_map(|r| r.field(&spec.id))
                        .filter_map(FieldValue::as_numeric)
                        .filter(|v| *v > 0.0)
                        .collect();
                    if values.len() >= min_samples {
                        numeric.insert(spec.id.clone(), summarize(&values));
                    }
                }
                FieldType::Status => {
                    let mut counts: HashMap<String, usize> = HashMap::new();
                    for record in records {
                        if let Some(FieldValue::Valid(v)) = record.field(&spec.id) {
                            *counts.entry(v.to_string()).or_insert(0) += 1;
                        }
                    }
                    // ties broken lexicographically for determinism
                    if let Some(mode) = counts
                        .into_iter()
                        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                    {
                        modes.insert(spec.id.clone(), mode.0);
                    }
                }
                FieldType::Time => {}
            }
        }

        Self { numeric, modes }
    }

    pub fn numeric_summary(&self, id: &FieldId) -> Option<&NumericSummary> {
        self.numeric.get(id)
    }

    pub fn median(&self, id: &FieldId) -> Option<f64> {
        self.numeric.get(id).map(|s| s.median)
    }

    /// Contextual center of a field for oracle prompts: median for numeric
    /// fields, most common value for status fields.
    pub fn center(&self, id: &FieldId) -> Option<FieldCenter> {
        if let Some(summary) = self.numeric.get(id) {
            return Some(FieldCenter::Median(summary.median));
        }
        self.modes.get(id).map(|m| FieldCenter::Mode(m.clone()))
    }
}

fn summarize(values: &[f64]) -> NumericSummary {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mean_val = mean(values);
    NumericSummary {
        median: median_sorted(&sorted),
        mean: mean_val,
        std_dev: std_deviation(values, mean_val),
        sample_count: values.len(),
    }
}

/// Compute the mean of a slice.
pub(crate) fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Compute sample standard deviation given a precomputed mean.
pub(crate) fn std_deviation(data: &[f64], mean_val: f64) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let variance =
        data.iter().map(|x| (x - mean_val).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Median of pre-sorted data, averaging the two middle elements for even
/// lengths.
pub(crate) fn median_sorted(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
