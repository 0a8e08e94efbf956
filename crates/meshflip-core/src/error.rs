//! Error types for spec and config handling.

use thiserror::Error;

/// Result type alias for spec operations.
pub type SpecResult<T> = Result<T, SpecError>;

/// Errors raised while loading or validating deployment specs.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("invalid deployment spec: {}", .issues.join("; "))]
    Invalid { issues: Vec<String> },

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("duplicate environment key: {0}")]
    DuplicateEnvironment(String),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("node name pattern: {0}")]
    Pattern(#[from] regex::Error),
}
