use super::ValidationError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to parse JSON config '{path}': {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported config extension '{ext}'. Use .toml or .json.")]
    UnsupportedExtension { ext: String },
    #[error("Config file must have .toml or .json extension.")]
    MissingExtension,
    #[error("Invalid duration for '{field}': {source}")]
    InvalidDuration {
        field: &'static str,
        #[source]
        source: ValidationError,
    },
    #[error("Config '{field}' must be >= 1: {source}")]
    FieldMustBePositive {
        field: &'static str,
        #[source]
        source: ValidationError,
    },
    #[error("Config 'trafficsim.loss_threshold_pct' must be <= 100 (got {value}).")]
    LossThresholdOutOfRange { value: u64 },
    #[error("Tool '{kind}' must name a program.")]
    ToolProgramEmpty { kind: String },
    #[error("Unknown tool kind '{kind}'.")]
    UnknownToolKind { kind: String },
    #[error("Failed to read probe snapshot '{path}': {source}")]
    ReadSnapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse probe snapshot '{path}': {source}")]
    ParseSnapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
