//! Error types for the survey indexer
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.
//! Every error is classified as either permanent (the event is skipped and the
//! cursor advances past it) or retryable (nothing is committed and the event is
//! replayed after the next reconnect).

use std::fmt;
use thiserror::Error;

/// Result type alias for indexer operations
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Failure to turn a loosely-typed record into a typed value.
///
/// The `String` payloads are field paths such as `questions[1].options[0].id`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Required field absent or empty
    #[error("{0} is required")]
    Missing(String),

    /// Field present but of the wrong shape
    #[error("{field} must be {expected}")]
    Malformed {
        field: String,
        expected: &'static str,
    },

    /// Frame could not be parsed as JSON at all
    #[error("invalid frame: {0}")]
    Frame(String),

    /// Commit carried an operation we do not understand
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
}

impl DecodeError {
    /// Create a missing-field error
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing(field.into())
    }

    /// Create a malformed-field error
    pub fn malformed(field: impl Into<String>, expected: &'static str) -> Self {
        Self::Malformed {
            field: field.into(),
            expected,
        }
    }

    /// Field path that failed, when there is one
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Missing(field) | Self::Malformed { field, .. } => Some(field),
            Self::Frame(_) | Self::UnknownOperation(_) => None,
        }
    }
}

/// Primary error type for all indexer operations
#[derive(Error, Debug)]
pub enum IndexerError {
    /// WebSocket connect or read errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database errors (pool exhaustion, write failure, lost connection)
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Record or envelope failed to decode
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Repository tried to mutate a record it does not own
    #[error("Unauthorized: {repository} does not own {record} (owner {owner})")]
    Unauthorized {
        repository: String,
        owner: String,
        record: String,
    },

    /// Referenced survey is not indexed
    #[error("Survey not found: {uri}")]
    SurveyNotFound { uri: String },

    /// Cursor singleton row is not provisioned
    #[error("Cursor row not found (id={id} should exist)")]
    CursorMissing { id: i32 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexerError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authorization error
    pub fn unauthorized(
        repository: impl Into<String>,
        owner: impl Into<String>,
        record: impl Into<String>,
    ) -> Self {
        Self::Unauthorized {
            repository: repository.into(),
            owner: owner.into(),
            record: record.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// The event itself is at fault; replaying it can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Unauthorized { .. } | Self::SurveyNotFound { .. }
        )
    }

    /// Check if error is retryable after a reconnect
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Storage { .. } | Self::Timeout { .. }
        )
    }

    /// Check if error must abort the process instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CursorMissing { .. } | Self::Configuration { .. })
    }

    /// Stable label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Storage { .. } => "storage",
            Self::Decode(_) => "decode",
            Self::Unauthorized { .. } => "unauthorized",
            Self::SurveyNotFound { .. } => "survey_not_found",
            Self::CursorMissing { .. } => "cursor_missing",
            Self::Configuration { .. } => "configuration",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub collection: Option<String>,
    pub record_key: Option<String>,
    pub sequence: Option<i64>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref collection) = self.collection {
            write!(f, " collection={}", collection)?;
        }
        if let Some(ref rkey) = self.record_key {
            write!(f, " rkey={}", rkey)?;
        }
        if let Some(seq) = self.sequence {
            write!(f, " seq={}", seq)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                collection = ?ctx.collection,
                rkey = ?ctx.record_key,
                sequence = ?ctx.sequence,
                "Operation failed"
            );
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(IndexerError::from(DecodeError::missing("name")).is_permanent());
        assert!(IndexerError::unauthorized("did:a", "did:b", "rk").is_permanent());
        assert!(IndexerError::storage("pool exhausted").is_retryable());
        assert!(!IndexerError::storage("pool exhausted").is_permanent());
        assert!(IndexerError::CursorMissing { id: 1 }.is_fatal());
        assert!(!IndexerError::CursorMissing { id: 1 }.is_retryable());
    }

    #[test]
    fn test_decode_error_field_path() {
        let err = DecodeError::malformed("questions[1].options[0].id", "a string");
        assert_eq!(err.field(), Some("questions[1].options[0].id"));
        assert_eq!(
            err.to_string(),
            "questions[1].options[0].id must be a string"
        );
        assert_eq!(DecodeError::missing("name").to_string(), "name is required");
    }

    #[test]
    fn test_error_context_display() {
        let ctx = ErrorContext {
            component: "processor",
            operation: "apply".to_string(),
            collection: Some("net.openmeet.survey".to_string()),
            record_key: Some("3k2a".to_string()),
            sequence: Some(100),
        };
        assert_eq!(
            ctx.to_string(),
            "[processor::apply] collection=net.openmeet.survey rkey=3k2a seq=100"
        );
    }
}
