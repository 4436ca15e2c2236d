//! Error types for coordination store access.

use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a [`KvStore`](crate::KvStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key (or directory) does not exist. etcd error code 100.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A compare-and-swap / compare-and-delete precondition did not hold.
    /// etcd error code 101.
    #[error("compare failed on {key}: {cause}")]
    TestFailed { key: String, cause: String },

    /// A file operation was attempted on a directory. etcd error code 102.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// A directory operation needed `recursive`. etcd error code 108.
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),

    /// The requested watch index has been compacted away. etcd error code 401.
    #[error("event index cleared: {0}")]
    IndexCleared(String),

    /// Any other error reported by the store.
    #[error("store error {code}: {message}")]
    Api { code: u32, message: String },

    /// The watch connection ended without delivering an event.
    #[error("watch disconnected: {0}")]
    Disconnected(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error means "the key is absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether this error is a rejected precondition.
    pub fn is_test_failed(&self) -> bool {
        matches!(self, StoreError::TestFailed { .. })
    }

    /// Map an etcd v2 error body onto a variant.
    pub fn from_etcd(code: u32, message: String, cause: String) -> Self {
        match code {
            100 => StoreError::NotFound(cause),
            101 => StoreError::TestFailed { key: cause, cause: message },
            102 => StoreError::NotAFile(cause),
            108 => StoreError::DirNotEmpty(cause),
            401 => StoreError::IndexCleared(cause),
            _ => StoreError::Api { code, message },
        }
    }
}
