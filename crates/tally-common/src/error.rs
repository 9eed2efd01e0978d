//! Error types for Tally rating
//!
//! Provides a unified error type shared by every stage of the rating path.
//! The type is `Clone` because one failure inside a coalesced group is
//! reported to every request of that group.

use thiserror::Error;

/// Result type alias using TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

/// Unified error type for Tally operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TallyError {
    // Input errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Lock errors
    #[error("Timed out after {waited_ms}ms waiting for lock on {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    // Configuration defects
    #[error("No rate function configured for metric {metric} of resource {resource_id}")]
    ConfigMissing { resource_id: String, metric: String },

    // Collaborator errors after retries are exhausted or the circuit is open
    #[error("Upstream {service} unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    // Optimistic concurrency violations
    #[error("Revision conflict on {key}: expected revision {expected:?} is stale")]
    ConcurrentRevisionConflict { key: String, expected: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    // Transient storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Transient network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Whether the failed call may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, TallyError::Storage(_) | TallyError::Network(_))
    }

    /// Stable label for diagnostics, response bodies and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            TallyError::Validation(_) => "validation",
            TallyError::LockTimeout { .. } => "lock_timeout",
            TallyError::ConfigMissing { .. } => "config_missing",
            TallyError::UpstreamUnavailable { .. } => "upstream_unavailable",
            TallyError::ConcurrentRevisionConflict { .. } => "revision_conflict",
            TallyError::NotFound(_) => "not_found",
            TallyError::Storage(_) => "storage",
            TallyError::Network(_) => "network",
            TallyError::Serialization(_) => "serialization",
            TallyError::Config(_) => "config",
            TallyError::Internal(_) => "internal",
        }
    }

    pub fn upstream(service: impl Into<String>, reason: impl Into<String>) -> Self {
        TallyError::UpstreamUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        TallyError::Storage(err.to_string())
    }
}
