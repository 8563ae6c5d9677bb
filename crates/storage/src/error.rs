//! Storage engine error types.

use thiserror::Error;

/// Attachment storage operation errors.
///
/// Backend-specific OS and SDK errors are translated into this taxonomy at
/// the backend boundary; callers above the engine never see raw `errno`
/// values or S3 status codes.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    NoAccess(String),

    #[error("database error: {0}")]
    Database(#[from] coffer_metadata::MetadataError),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unable to complete: {0}")]
    UnableToComplete(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Translate an I/O error at the backend boundary, attaching the
    /// instance or path it concerned.
    pub fn from_io(what: impl std::fmt::Display, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(what.to_string()),
            std::io::ErrorKind::PermissionDenied => StorageError::NoAccess(what.to_string()),
            _ => StorageError::Io(err),
        }
    }

    /// Whether this error is the NotFound kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
