//! Error types for a3s-audit

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the audit delivery system
#[derive(Debug, Error)]
pub enum AuditError {
    /// Call rejected by an open circuit breaker; the store was not touched
    #[error("Circuit open: retry after {retry_after:?}")]
    CircuitOpen {
        retry_after: Duration,
    },

    /// Transient backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Store call exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Query against the audit trail failed
    ///
    /// Reads have no retry path, so this is always surfaced to the caller.
    #[error("Audit search failed: {0}")]
    Search(String),

    /// Configuration or construction error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuditError {
    /// Whether the failure should count against the breaker and be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuditError::Store(_) | AuditError::Timeout(_) | AuditError::Io(_)
        )
    }
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
