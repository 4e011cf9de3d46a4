//! Error taxonomy shared by every layer of the cache engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing required fields, malformed key, empty path set.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// `restore` asked for an object the backend cannot produce.
    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    /// `save` resolved zero paths after glob expansion.
    #[error("No files to cache: none of the requested paths resolved to anything")]
    NoFilesToCache,

    /// Explicit compression method requested but its encoder is unavailable.
    #[error("Compression method unavailable: {0}")]
    CompressionUnavailable(String),

    /// Index JSON/version problems. Usually recovered via rebuild (local) or
    /// an empty index (remote); only surfaced when unrecoverable.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// Remote index optimistic-concurrency precondition failed. Retriable.
    #[error("Concurrent modification of index detected, retry the save")]
    ConcurrentModification,

    /// Lock manager exhausted its retry budget.
    #[error("Failed to acquire lock {0:?} after exhausting retries")]
    LockAcquisitionFailed(String),

    /// Transport/permission/quota failure from a storage backend.
    #[error("Backend error during {operation} on {location}: {message}")]
    Backend {
        operation: String,
        location: String,
        message: String,
    },

    /// Permission denied, disk full, read-only filesystem, device I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    pub fn backend(
        operation: impl Into<String>,
        location: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Error::Backend {
            operation: operation.into(),
            location: location.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_messages_include_operation_and_location() {
        let err = Error::backend("put", "archives/sha256-abc.tar.zst", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("put"));
        assert!(msg.contains("archives/sha256-abc.tar.zst"));
        assert!(msg.contains("connection reset"));
    }
}
