//! Storage backend trait

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// A payload together with its serialized metadata record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub meta: Bytes,
}

/// Metadata of one object, as returned by bucket listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    /// Payload size in bytes as found in the medium
    pub size: u64,
    pub meta: Bytes,
}

/// Best-effort view of how much space the medium is using
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEstimate {
    Available { used: u64, quota: u64 },
    /// The medium can't tell. Callers must not read this as zero usage.
    Unavailable,
}

/// Storage backend trait
///
/// Implementations provide a bucketed key/value store. A `write` fully
/// replaces any previous object under the same key and must never leave a
/// partially written object visible to `read`. Callers are responsible for
/// serializing concurrent writes to one key.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read an object with its metadata
    async fn read(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError>;

    /// Write an object, replacing whatever was stored under the key
    async fn write(
        &self,
        bucket: &str,
        key: &str,
        object: StoredObject,
    ) -> Result<(), StorageError>;

    /// Replace only the metadata record of an existing object
    async fn write_meta(&self, bucket: &str, key: &str, meta: Bytes) -> Result<(), StorageError>;

    /// Delete an object, returning whether it existed
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// List the metadata of every complete object in a bucket
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectMeta>, StorageError>;

    /// List the names of all buckets present in the medium
    async fn list_buckets(&self) -> Result<Vec<String>, StorageError>;

    /// Remove a bucket and everything in it, returning the number of objects removed
    async fn delete_bucket(&self, bucket: &str) -> Result<u64, StorageError>;

    /// Estimate current usage of the medium
    async fn estimate_usage(&self) -> StorageEstimate;
}

/// Compute the lowercase hex SHA-256 of some data, for use as an object key
pub fn compute_key(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Validate an object key before it's used to build a path.
///
/// Keys are restricted to ASCII alphanumerics, `-` and `_`, and must be at
/// least two characters long (the first two are used for sharding).
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.len() < 2 {
        return Err(StorageError::InvalidKey(format!("Key too short: {}", key)));
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Validate a bucket name: lowercase alphanumerics, `-`, `_` and `.`, no `..`
pub fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    let valid_chars = bucket.bytes().all(|b| {
        b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' || b == b'.'
    });
    if bucket.is_empty() || !valid_chars || bucket.contains("..") || bucket.starts_with('.') {
        return Err(StorageError::InvalidBucket(bucket.to_string()));
    }
    Ok(())
}
