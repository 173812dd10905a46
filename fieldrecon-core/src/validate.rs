//! Per-value field validation and normalization.
//!
//! `validate` is pure: it tags a raw reading as `Valid(normalized)` or
//! `Invalid(raw, reason)` and never coerces silently. Invalid fields keep
//! their raw reading inside the record until (possibly) fixed by oracle
//! escalation.

use crate::config::ValidationConfig;
use crate::report::AbnormalField;
use crate::schema::{FieldType, SourceSchema};
use crate::types::{FieldValue, NormalizedValue, ObservationRecord, StatusValue};
use regex::Regex;
use tracing::debug;

/// Validates raw field readings against their declared types.
pub struct FieldValidator {
    integer_re: Regex,
    float_re: Regex,
    time_re: Regex,
    non_integer_chars: Regex,
    max_decimals: usize,
}

impl FieldValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            integer_re: Regex::new(r"^-?\d+$").unwrap(),
            float_re: Regex::new(r"^-?\d+(\.\d+)?$").unwrap(),
            time_re: Regex::new(r"^\d{1,2}:\d{2}:\d{2}$").unwrap(),
            non_integer_chars: Regex::new(r"[^\d\-]").unwrap(),
            max_decimals: config.max_decimals,
        }
    }

    /// Validate one raw reading against a declared field type.
    pub fn validate(&self, raw: &str, field_type: FieldType) -> FieldValue {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
            return invalid(raw, "empty value");
        }

        match field_type {
            FieldType::Status => self.validate_status(raw, trimmed),
            FieldType::Integer => self.validate_integer(raw, trimmed),
            FieldType::Float => self.validate_float(raw, trimmed),
            FieldType::Time => self.validate_time(raw, trimmed),
        }
    }

    fn validate_status(&self, raw: &str, trimmed: &str) -> FieldValue {
        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with('O') {
            return FieldValue::Valid(NormalizedValue::Status(StatusValue::Ok));
        }
        // NG takes precedence over the contains-'O' rule so that readings
        // like "NO" classify as NG.
        if upper.starts_with('N') || upper == "G" {
            return FieldValue::Valid(NormalizedValue::Status(StatusValue::Ng));
        }
        if upper.contains('O') || upper.contains('K') || upper.contains('0') {
            return FieldValue::Valid(NormalizedValue::Status(StatusValue::Ok));
        }
        invalid(raw, "unrecognized status")
    }

    fn validate_integer(&self, raw: &str, trimmed: &str) -> FieldValue {
        // Readers often smear units or stray glyphs around the digits.
        let stripped = self.non_integer_chars.replace_all(trimmed, "");
        if self.integer_re.is_match(&stripped) {
            if let Ok(n) = stripped.parse::<i64>() {
                return FieldValue::Valid(NormalizedValue::Integer(n));
            }
        }
        invalid(raw, "not an integer")
    }

    fn validate_float(&self, raw: &str, trimmed: &str) -> FieldValue {
        if !self.float_re.is_match(trimmed) {
            return invalid(raw, "not a float");
        }
        if let Some((_, frac)) = trimmed.split_once('.') {
            if frac.len() > self.max_decimals {
                // flagged, never truncated
                return invalid(raw, "excess precision");
            }
        }
        match trimmed.parse::<f64>() {
            Ok(v) => FieldValue::Valid(NormalizedValue::Float(v)),
            Err(_) => invalid(raw, "not a float"),
        }
    }

    fn validate_time(&self, raw: &str, trimmed: &str) -> FieldValue {
        if self.time_re.is_match(trimmed) {
            FieldValue::Valid(NormalizedValue::Time(trimmed.to_string()))
        } else {
            invalid(raw, "bad time format")
        }
    }

    /// Re-tag every schema field of every record, collecting all invalid
    /// readings into an abnormal-field report. Records keep their raw
    /// values inside the `Invalid` tags.
    pub fn validate_batch(
        &self,
        records: &mut [ObservationRecord],
        schema: &SourceSchema,
    ) -> Vec<AbnormalField> {
        let mut abnormal = Vec::new();
        for record in records.iter_mut() {
            for spec in &schema.fields {
                let Some(value) = record.fields.get(&spec.id) else {
                    continue;
                };
                let raw = value.canonical();
                let tagged = self.validate(&raw, spec.field_type);
                if let FieldValue::Invalid { raw, reason } = &tagged {
                    abnormal.push(AbnormalField {
                        key: record.key.clone(),
                        field_id: spec.id.clone(),
                        raw_value: raw.clone(),
                        reason: reason.clone(),
                    });
                }
                record.fields.insert(spec.id.clone(), tagged);
            }
        }
        debug!(
            records = records.len(),
            abnormal = abnormal.len(),
            "batch validation complete"
        );
        abnormal
    }
}

fn invalid(raw: &str, reason: &str) -> FieldValue {
    FieldValue::Invalid {
        raw: raw.to_string(),
        reason: reason.to_string(),
    }
}
