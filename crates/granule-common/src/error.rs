//! Error types shared by the storage and ingestion crates.

use thiserror::Error;

/// Result type alias using GranuleError.
pub type GranuleResult<T> = Result<T, GranuleError>;

/// Infrastructure error type for queue, object store and configuration access.
#[derive(Debug, Error)]
pub enum GranuleError {
    // === Input Errors ===
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter value for '{param}': {message}")]
    InvalidParameter { param: String, message: String },

    #[error("Invalid time specification: {0}")]
    InvalidTime(String),

    #[error("Invalid object URI: {0}")]
    InvalidUri(String),

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    // === Infrastructure Errors ===
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Request timeout")]
    Timeout,
}

impl GranuleError {
    /// Whether the operation may succeed if attempted again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GranuleError::StorageError(_) | GranuleError::QueueError(_) | GranuleError::Timeout
        )
    }
}

impl From<std::io::Error> for GranuleError {
    fn from(err: std::io::Error) -> Self {
        GranuleError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for GranuleError {
    fn from(err: serde_json::Error) -> Self {
        GranuleError::InternalError(format!("JSON error: {}", err))
    }
}
