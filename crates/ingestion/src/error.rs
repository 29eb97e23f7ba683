//! Error types for the ingestion crate.
//!
//! Every stage has its own error enum; each maps to an [`ErrorKind`], which is
//! what the dispatcher records per message and what decides between
//! redelivery and immediate dead-lettering.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinator::IllegalTransition;

/// Classification of per-item failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DiscoveryError,
    TranscodeError,
    AmbiguousEventShape,
    MalformedMessage,
    DatetimeParseError,
    BuildError,
    UnsupportedProjection,
    LoadError,
    LoadRejected,
    Timeout,
    /// The item pipeline broke its own state machine.
    InternalError,
}

impl ErrorKind {
    /// Retryable kinds are left on the queue for redelivery; the rest are
    /// dead-lettered immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::DiscoveryError
                | ErrorKind::TranscodeError
                | ErrorKind::BuildError
                | ErrorKind::LoadError
                | ErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DiscoveryError => "discovery_error",
            ErrorKind::TranscodeError => "transcode_error",
            ErrorKind::AmbiguousEventShape => "ambiguous_event_shape",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::DatetimeParseError => "datetime_parse_error",
            ErrorKind::BuildError => "build_error",
            ErrorKind::UnsupportedProjection => "unsupported_projection",
            ErrorKind::LoadError => "load_error",
            ErrorKind::LoadRejected => "load_rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while enumerating source files.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Catalog search failed: {0}")]
    Catalog(String),

    #[error("Granule {granule_id} has no link matching {selector}")]
    NoMatchingLink { granule_id: String, selector: String },

    #[error("Object listing failed: {0}")]
    Storage(String),

    #[error("Failed to obtain credentials: {0}")]
    Credentials(String),

    #[error("Invalid filename filter: {0}")]
    InvalidFilter(String),

    #[error("No event template for {0}: a filename pattern is required for files without a granule id")]
    MissingTemplate(String),

    #[error("Failed to submit {source_uri}: {message}")]
    Submit { source_uri: String, message: String },
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DiscoveryError
    }
}

/// Errors from the raster transcoding adapter.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Invalid source URI: {0}")]
    InvalidSource(String),

    #[error("Unsupported raster format: {0}")]
    UnsupportedFormat(String),

    #[error("Transcoding service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Transcoding request failed: {0}")]
    Request(String),

    #[error("Transcoding timed out after {0:?}")]
    Timeout(Duration),
}

impl TranscodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TranscodeError
    }
}

/// Errors from validating a message or building its catalog record.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Event must carry exactly one of granule_id or filename_pattern: {0}")]
    AmbiguousEventShape(String),

    #[error("Failed to derive datetime from {key}: {reason}")]
    DatetimeParse { key: String, reason: String },

    #[error("Granule not found in catalog: {0}")]
    GranuleNotFound(String),

    #[error("Catalog lookup failed: {0}")]
    Catalog(String),

    #[error("Failed to read raster {uri}: {reason}")]
    Raster { uri: String, reason: String },

    #[error("Unsupported projection: {0}")]
    UnsupportedProjection(String),

    #[error("Invalid catalog record: {0}")]
    InvalidRecord(String),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Malformed(_) => ErrorKind::MalformedMessage,
            BuildError::AmbiguousEventShape(_) => ErrorKind::AmbiguousEventShape,
            BuildError::DatetimeParse { .. } => ErrorKind::DatetimeParseError,
            BuildError::UnsupportedProjection(_) => ErrorKind::UnsupportedProjection,
            BuildError::GranuleNotFound(_)
            | BuildError::Catalog(_)
            | BuildError::Raster { .. }
            | BuildError::InvalidRecord(_) => ErrorKind::BuildError,
        }
    }
}

/// Errors from loading a record into the catalog database.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to stage record: {0}")]
    Staging(String),

    #[error("Catalog database unavailable: {0}")]
    Connection(String),

    #[error("Catalog rejected record schema: {0}")]
    Schema(String),

    #[error("Catalog constraint violated: {0}")]
    Constraint(String),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Staging(_) | LoadError::Connection(_) => ErrorKind::LoadError,
            LoadError::Schema(_) | LoadError::Constraint(_) => ErrorKind::LoadRejected,
        }
    }
}

impl From<storage::CatalogStoreError> for LoadError {
    fn from(err: storage::CatalogStoreError) -> Self {
        use storage::CatalogStoreError as E;
        match err {
            E::Connection(msg) => LoadError::Connection(msg),
            E::Io(msg) => LoadError::Staging(msg),
            E::Schema(msg) => LoadError::Schema(msg),
            E::Constraint(msg) => LoadError::Constraint(msg),
        }
    }
}

/// Failure of one item anywhere between dequeue and catalog load.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Item pipeline exceeded {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Internal(#[from] IllegalTransition),
}

impl ItemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ItemError::Transcode(e) => e.kind(),
            ItemError::Build(e) => e.kind(),
            ItemError::Load(e) => e.kind(),
            ItemError::Timeout(_) => ErrorKind::Timeout,
            ItemError::Internal(_) => ErrorKind::InternalError,
        }
    }
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, ItemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_by_kind() {
        let retryable = [
            ErrorKind::TranscodeError,
            ErrorKind::BuildError,
            ErrorKind::LoadError,
            ErrorKind::Timeout,
        ];
        let terminal = [
            ErrorKind::AmbiguousEventShape,
            ErrorKind::MalformedMessage,
            ErrorKind::DatetimeParseError,
            ErrorKind::UnsupportedProjection,
            ErrorKind::LoadRejected,
            ErrorKind::InternalError,
        ];
        assert!(retryable.iter().all(|k| k.is_retryable()));
        assert!(terminal.iter().all(|k| !k.is_retryable()));
    }

    #[test]
    fn test_store_errors_map_to_load_kinds() {
        let rejected: LoadError = storage::CatalogStoreError::Constraint("fk".into()).into();
        assert_eq!(rejected.kind(), ErrorKind::LoadRejected);

        let transient: LoadError = storage::CatalogStoreError::Connection("reset".into()).into();
        assert_eq!(transient.kind(), ErrorKind::LoadError);
    }

    #[test]
    fn test_item_error_kind_passthrough() {
        let err: ItemError = BuildError::UnsupportedProjection("EPSG:32633".into()).into();
        assert_eq!(err.kind(), ErrorKind::UnsupportedProjection);
        assert_eq!(ItemError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DatetimeParseError).unwrap();
        assert_eq!(json, "\"datetime_parse_error\"");
    }
}
