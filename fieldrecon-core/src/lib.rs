//! # Fieldrecon Core
//!
//! Core library for the fieldrecon observation reconciliation engine.
//! Takes noisy, time-ordered machine-state observations from an error-prone
//! field reader and produces a clean, deduplicated event log: validation,
//! outlier annotation, fuzzy redundancy matching, oracle-mediated conflict
//! escalation, chain consolidation, and a final output audit.

pub mod audit;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod escalate;
pub mod outlier;
pub mod pipeline;
pub mod report;
pub mod schema;
pub mod similarity;
pub mod stats;
pub mod types;
pub mod validate;

// Re-export commonly used types at the crate root.
pub use audit::{AuditIssue, AuditReport, EventAuditor, IssueKind, Severity};
pub use config::{
    EscalationConfig, OutlierConfig, OutlierMode, ReconConfig, SimilarityConfig, TimeStateConfig,
    ValidationConfig,
};
pub use consolidate::{Chain, ChainConsolidator, ConsolidationOutcome};
pub use error::{ConfigError, FieldReconError, OracleError, Result, StructuralError};
pub use escalate::{
    ConflictEscalator, EvidenceProvider, NoEvidence, Oracle, OracleRequest, ScriptedOracle,
    StaticEvidence,
};
pub use outlier::OutlierDetector;
pub use pipeline::{Pipeline, RunOutcome};
pub use report::{
    AbnormalField, BatchOutput, DeletionEntry, OutlierAnnotation, VerdictRecord, VerdictReport,
};
pub use schema::{FieldId, FieldSpec, FieldType, SchemaRegistry, SourceSchema};
pub use similarity::{fingerprint, similarity, LabelOutcome, SimilarityMatcher};
pub use stats::{FieldStatistics, NumericSummary};
pub use types::{
    ConflictCase, Event, EvidenceHandle, FieldCenter, FieldValue, NormalizedValue,
    ObservationRecord, RecordKey, RecordLabels, RedundancyLabel, StatusValue, TimePhase,
    TimeState, Verdict,
};
