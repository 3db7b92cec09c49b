//! Error types for the core domain

use thiserror::Error;

/// Core domain errors
///
/// Collaborator implementations (stores, completion and embedding services)
/// report through this type so callers can tell transient failures apart.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unparsable response: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Timeout(_) | CoreError::RateLimited(_))
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
