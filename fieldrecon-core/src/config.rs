//! Configuration for the reconciliation engine.
//!
//! Uses `figment` for layered configuration: built-in defaults -> TOML file
//! -> environment variables prefixed with `FIELDRECON_` (nested keys joined
//! with `__`, e.g. `FIELDRECON_SIMILARITY__DEFAULT_THRESHOLD=0.85`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration for a reconciliation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconConfig {
    pub validation: ValidationConfig,
    pub outlier: OutlierConfig,
    pub similarity: SimilarityConfig,
    pub time_state: TimeStateConfig,
    pub escalation: EscalationConfig,
}

/// Per-value validation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum decimal digits a Float value may carry before it is flagged
    /// as excess precision. The value is never truncated, only flagged.
    pub max_decimals: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { max_decimals: 3 }
    }
}

/// Statistical outlier detection mode. Exactly one mode is active per
/// deployment, by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutlierMode {
    /// Flag when value/median exceeds `threshold` or falls below its
    /// reciprocal.
    Ratio { threshold: f64 },
    /// Flag when |value - mean| / std exceeds `threshold`.
    ZScore { threshold: f64 },
}

impl Default for OutlierMode {
    fn default() -> Self {
        OutlierMode::Ratio { threshold: 5.0 }
    }
}

/// Outlier detection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierConfig {
    #[serde(flatten)]
    pub mode: OutlierMode,
    /// Minimum count of positive, non-zero valid samples a field needs
    /// before its column is scanned at all.
    pub min_samples: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            mode: OutlierMode::default(),
            min_samples: 5,
        }
    }
}

/// Fuzzy redundancy matching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Similarity threshold applied when no per-source override exists.
    pub default_threshold: f64,
    /// Per-source overrides keyed by `SourceSchema::source_id`. Sources
    /// with many comparable fields typically want a higher threshold.
    #[serde(default)]
    pub per_source: HashMap<String, f64>,
}

impl SimilarityConfig {
    /// The threshold in effect for a given source.
    pub fn threshold_for(&self, source_id: &str) -> f64 {
        self.per_source
            .get(source_id)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.80,
            per_source: HashMap::new(),
        }
    }
}

/// Device-clock freeze detection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeStateConfig {
    /// Seconds a device clock may sit unchanged before the record is
    /// labeled Frozen instead of Static.
    pub frozen_threshold_secs: f64,
}

impl Default for TimeStateConfig {
    fn default() -> Self {
        Self {
            frozen_threshold_secs: 10.0,
        }
    }
}

/// Oracle escalation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Upper bound on concurrent oracle calls. The oracle is a shared,
    /// rate-limited external resource.
    pub max_concurrent: usize,
    /// Per-call timeout. A timed-out case degrades to Unresolved.
    pub timeout_secs: u64,
    /// Relative distance from the contextual median within which a
    /// NewValue verdict is annotated as close to the median.
    pub median_tolerance: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            timeout_secs: 60,
            median_tolerance: 0.1,
        }
    }
}

impl ReconConfig {
    /// Load configuration with layering: defaults -> optional TOML file ->
    /// `FIELDRECON_` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ReconConfig::default()));

        if let Some(path) = config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("FIELDRECON_").split("__"));

        let config: ReconConfig = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave silently.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity.default_threshold)
            || self.similarity.default_threshold == 0.0
        {
            return Err(ConfigError::Invalid {
                message: "similarity.default_threshold must be within (0, 1]".into(),
            });
        }
        for (source, t) in &self.similarity.per_source {
            if !(0.0..=1.0).contains(t) || *t == 0.0 {
                return Err(ConfigError::Invalid {
                    message: format!("similarity override for '{source}' must be within (0, 1]"),
                });
            }
        }
        match self.outlier.mode {
            OutlierMode::Ratio { threshold } if threshold <= 1.0 => {
                return Err(ConfigError::Invalid {
                    message: "outlier ratio threshold must be greater than 1".into(),
                });
            }
            OutlierMode::ZScore { threshold } if threshold <= 0.0 => {
                return Err(ConfigError::Invalid {
                    message: "outlier z-score threshold must be positive".into(),
                });
            }
            _ => {}
        }
        if self.outlier.min_samples == 0 {
            return Err(ConfigError::Invalid {
                message: "outlier.min_samples must be at least 1".into(),
            });
        }
        if self.time_state.frozen_threshold_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "time_state.frozen_threshold_secs must be positive".into(),
            });
        }
        if self.escalation.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                message: "escalation.max_concurrent must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReconConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.validation.max_decimals, 3);
        assert_eq!(config.outlier.min_samples, 5);
        assert_eq!(config.outlier.mode, OutlierMode::Ratio { threshold: 5.0 });
        assert_eq!(config.similarity.default_threshold, 0.80);
        assert_eq!(config.time_state.frozen_threshold_secs, 10.0);
        assert_eq!(config.escalation.max_concurrent, 8);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = ReconConfig::load(None).unwrap();
        assert_eq!(config.validation.max_decimals, 3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = ReconConfig::load(Some(Path::new("/nonexistent/recon.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[similarity]
default_threshold = 0.90

[similarity.per_source]
nozzle = 0.95
terminal = 0.90

[outlier]
mode = "z_score"
threshold = 3.0
min_samples = 10
"#
        )
        .unwrap();

        let config = ReconConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.similarity.default_threshold, 0.90);
        assert_eq!(config.similarity.threshold_for("nozzle"), 0.95);
        assert_eq!(config.outlier.mode, OutlierMode::ZScore { threshold: 3.0 });
        assert_eq!(config.outlier.min_samples, 10);
        // untouched sections keep their defaults
        assert_eq!(config.validation.max_decimals, 3);
    }

    #[test]
    fn test_threshold_for_falls_back_to_default() {
        let mut similarity = SimilarityConfig::default();
        similarity.per_source.insert("cslot".into(), 0.85);
        assert_eq!(similarity.threshold_for("cslot"), 0.85);
        assert_eq!(similarity.threshold_for("unknown"), 0.80);
    }

    #[test]
    fn test_validate_rejects_bad_similarity() {
        let mut config = ReconConfig::default();
        config.similarity.default_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ratio_threshold() {
        let mut config = ReconConfig::default();
        config.outlier.mode = OutlierMode::Ratio { threshold: 0.5 };
        assert!(config.validate().is_err());
    }
}
