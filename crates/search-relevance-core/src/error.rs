//! Error types for engine adapters and query dispatch

use std::time::Duration;

use thiserror::Error;

/// Result type alias for search operations
pub type SearchResult<T> = std::result::Result<T, SearchError>;

/// Errors that can occur while dispatching a query to an engine
#[derive(Debug, Error)]
pub enum SearchError {
    /// Caller error: empty term or out-of-range pagination. Never retried.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The backing engine could not be reached
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The adapter call exceeded its per-query deadline
    #[error("Search timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The engine stayed unavailable after the dispatcher exhausted its retries
    #[error("Service degraded after {attempts} attempts: {last_error}")]
    ServiceDegraded {
        /// Number of adapter calls made, including the first
        attempts: u32,
        /// Message of the final `EngineUnavailable`
        last_error: String,
    },

    /// No adapter registered under the requested name for this entity kind
    #[error("No engine named {name:?} registered for {entity}")]
    UnknownEngine {
        /// Entity kind label
        entity: String,
        /// Requested engine name
        name: String,
    },

    /// A result set or expectation broke a structural invariant
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// I/O error while loading engine data
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SearchError {
    /// Returns the error type string (for JSON responses and run reports)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::ServiceDegraded { .. } => "SERVICE_DEGRADED",
            Self::UnknownEngine { .. } => "UNKNOWN_ENGINE",
            Self::SchemaViolation(_) => "SCHEMA_VIOLATION",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Returns whether the dispatcher may retry the call.
    ///
    /// Timeouts are recorded as-is and never retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_))
    }
}
