//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid bucket name: {0}")]
    InvalidBucket(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn not_found(bucket: &str, key: &str) -> Self {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Whether this error means the object simply isn't there
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
