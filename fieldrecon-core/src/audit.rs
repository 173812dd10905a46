//! Post-pipeline quality audit of consolidated events.
//!
//! A last line of defense against reader noise that slipped through every
//! earlier stage: residual markup or model-control tokens inside values,
//! malformed numerics, duplicated-pattern strings, and implausibly inflated
//! integers. The audit only reports; it never mutates events.

use crate::config::ValidationConfig;
use crate::schema::{FieldId, FieldType, SourceSchema};
use crate::stats::FieldStatistics;
use crate::types::{Event, RecordKey};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
}

/// What kind of residue an audited value exhibits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// HTML tags, entities, markdown markers, or model-control tokens.
    ResidualMarkup,
    /// More than one decimal point in a numeric value.
    MultipleDecimalPoints,
    /// More fractional digits than the precision bound allows.
    ExcessDecimals,
    /// The value is a string repeated back to back (e.g. "9.1289.128").
    RepeatedPattern,
    /// Integer far above the batch median with suspiciously many digits,
    /// typical of two readings smeared together.
    InflatedInteger,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueKind::ResidualMarkup => write!(f, "residual markup"),
            IssueKind::MultipleDecimalPoints => write!(f, "multiple decimal points"),
            IssueKind::ExcessDecimals => write!(f, "excess decimals"),
            IssueKind::RepeatedPattern => write!(f, "repeated pattern"),
            IssueKind::InflatedInteger => write!(f, "inflated integer"),
        }
    }
}

/// One suspicious value found in the final output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditIssue {
    /// Representative key of the event carrying the value.
    pub event_key: RecordKey,
    pub field_id: FieldId,
    pub value: String,
    pub kind: IssueKind,
    pub severity: Severity,
}

/// All issues found in one audit pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditReport {
    pub issues: Vec<AuditIssue>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// Issue counts grouped by kind, in a stable order.
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.kind.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Scans consolidated events for residue the pipeline should have caught.
pub struct EventAuditor {
    markup_res: Vec<Regex>,
    max_decimals: usize,
}

impl EventAuditor {
    pub fn new(config: &ValidationConfig) -> Self {
        let markup_res = [
            r"<[^>|]+>",          // html-like tags
            r"&[a-zA-Z]+;",       // named entities
            r"&#\d+;",            // numeric entities
            r"```|\*\*|__",       // markdown markers
            r"<\|[a-zA-Z_]+\|>",  // model control tokens
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();
        Self {
            markup_res,
            max_decimals: config.max_decimals,
        }
    }

    /// Audit every field of every event against the schema and the batch
    /// statistics the events were built from.
    pub fn audit(
        &self,
        events: &[Event],
        schema: &SourceSchema,
        stats: &FieldStatistics,
    ) -> AuditReport {
        let mut report = AuditReport::default();

        for event in events {
            for spec in &schema.fields {
                let Some(value) = event.fields.get(&spec.id) else {
                    continue;
                };
                let text = value.canonical();
                self.check_value(
                    &event.representative_key,
                    &spec.id,
                    spec.field_type,
                    &text,
                    stats,
                    &mut report,
                );
            }
        }

        debug!(
            events = events.len(),
            issues = report.issues.len(),
            "output audit complete"
        );
        report
    }

    fn check_value(
        &self,
        event_key: &RecordKey,
        field_id: &FieldId,
        field_type: FieldType,
        text: &str,
        stats: &FieldStatistics,
        report: &mut AuditReport,
    ) {
        let mut push = |kind, severity| {
            report.issues.push(AuditIssue {
                event_key: event_key.clone(),
                field_id: field_id.clone(),
                value: text.to_string(),
                kind,
                severity,
            });
        };

        if self.markup_res.iter().any(|re| re.is_match(text)) {
            push(IssueKind::ResidualMarkup, Severity::High);
        }

        if is_repeated_pattern(text) {
            push(IssueKind::RepeatedPattern, Severity::High);
        }

        if field_type.is_numeric() {
            let dots = text.matches('.').count();
            if dots > 1 {
                push(IssueKind::MultipleDecimalPoints, Severity::High);
            } else if let Some((_, frac)) = text.split_once('.') {
                if frac.len() > self.max_decimals {
                    push(IssueKind::ExcessDecimals, Severity::Medium);
                }
            }
        }

        if field_type == FieldType::Integer {
            if let (Ok(value), Some(median)) = (text.parse::<i64>(), stats.median(field_id)) {
                if median > 0.0
                    && value as f64 > 3.0 * median
                    && digit_count(value) > digit_count(median as i64)
                {
                    push(IssueKind::InflatedInteger, Severity::Medium);
                }
            }
        }
    }
}

/// True when the trimmed value is some string repeated back to back, e.g.
/// a reader double-exposure like "9.1289.128".
fn is_repeated_pattern(text: &str) -> bool {
    let t = text.trim();
    let n = t.len();
    if n < 4 || n % 2 != 0 {
        return false;
    }
    let (a, b) = t.split_at(n / 2);
    a == b && a.chars().any(|c| c.is_ascii_digit())
}

fn digit_count(value: i64) -> usize {
    value.unsigned_abs().to_string().len()
}
