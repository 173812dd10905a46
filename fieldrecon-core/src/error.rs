//! Error types for the fieldrecon engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering structural batch errors, oracle escalation, and configuration.

use std::path::PathBuf;

/// Top-level error type for the fieldrecon core library.
#[derive(Debug, thiserror::Error)]
pub enum FieldReconError {
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural precondition violations. Fatal for the offending batch only;
/// other batches in the same run are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum StructuralError {
    #[error("Batch for source '{source_id}' is empty")]
    EmptyBatch { source_id: String },

    #[error("No schema matches batch (looked for discriminating fields in {candidates} registered schemas)")]
    UnknownSchema { candidates: usize },

    #[error("Record '{key}' is missing the required device-time field '{field}'")]
    MissingDeviceTime { key: String, field: String },

    #[error("Capture keys out of order: '{current}' follows '{previous}'")]
    KeysOutOfOrder { previous: String, current: String },

    #[error("Duplicate capture key: '{key}'")]
    DuplicateKey { key: String },

    #[error("Record '{key}' references field '{field}' not present in the schema")]
    UnknownField { key: String, field: String },
}

/// Errors from oracle escalation. These never abort a batch; the escalator
/// downgrades them to an `Unresolved` verdict and continues.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Oracle unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Oracle call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Oracle response could not be interpreted: {message}")]
    MalformedResponse { message: String },

    #[error("No evidence available for record '{key}' field '{field}'")]
    MissingEvidence { key: String, field: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `FieldReconError`.
pub type Result<T> = std::result::Result<T, FieldReconError>;
