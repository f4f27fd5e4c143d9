//! Error types for fixture loading, grading, and report export

use thiserror::Error;

/// Result type alias for evaluation operations
pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Errors that abort a relevance run
///
/// Individual query failures are never represented here; they are recorded in
/// the run report instead.
#[derive(Debug, Error)]
pub enum EvalError {
    /// A fixture file could not be parsed or failed validation
    #[error("Malformed fixture in {source_name} at {location}: {reason}")]
    MalformedFixture {
        /// File path or other label for the fixture source
        source_name: String,
        /// Line, record index, or `<file>` when the whole file is unreadable
        location: String,
        /// What was wrong
        reason: String,
    },

    /// A result set or expectation handed to the grader broke its shape
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// I/O error while reading fixtures or writing reports
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while writing reports
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EvalError {
    /// Build a [`EvalError::MalformedFixture`].
    pub fn malformed(
        source_name: impl Into<String>,
        location: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedFixture {
            source_name: source_name.into(),
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Returns the error type string
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::MalformedFixture { .. } => "MALFORMED_FIXTURE",
            Self::SchemaViolation(_) => "SCHEMA_VIOLATION",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}
