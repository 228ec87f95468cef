//! In-memory storage backend

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::backend::{ObjectMeta, StorageBackend, StorageEstimate, StoredObject, validate_bucket};
use crate::error::StorageError;

/// In-memory storage backend
///
/// Nothing survives the process. Useful for ephemeral caches and for tests.
#[derive(Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<String, StoredObject>>>,
    capacity: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capacity so `estimate_usage` can report a quota
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    fn used_bytes(&self) -> u64 {
        self.buckets
            .read()
            .values()
            .flat_map(|objects| objects.values())
            .map(|o| (o.body.len() + o.meta.len()) as u64)
            .sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| StorageError::not_found(bucket, key))
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        object: StoredObject,
    ) -> Result<(), StorageError> {
        validate_bucket(bucket)?;
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
        Ok(())
    }

    async fn write_meta(&self, bucket: &str, key: &str, meta: Bytes) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write();
        let object = buckets
            .get_mut(bucket)
            .and_then(|objects| objects.get_mut(key))
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        object.meta = meta;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .buckets
            .write()
            .get_mut(bucket)
            .and_then(|objects| objects.remove(key))
            .is_some())
    }

    async fn list(&self, bucket: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .map(|objects| {
                objects
                    .iter()
                    .map(|(key, object)| ObjectMeta {
                        key: key.clone(),
                        size: object.body.len() as u64,
                        meta: object.meta.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.buckets.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<u64, StorageError> {
        Ok(self
            .buckets
            .write()
            .remove(bucket)
            .map(|objects| objects.len() as u64)
            .unwrap_or(0))
    }

    async fn estimate_usage(&self) -> StorageEstimate {
        match self.capacity {
            Some(quota) => StorageEstimate::Available {
                used: self.used_bytes(),
                quota,
            },
            None => StorageEstimate::Unavailable,
        }
    }
}
