//! Local disk storage backend

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::backend::{
    ObjectMeta, StorageBackend, StorageEstimate, StoredObject, validate_bucket, validate_key,
};
use crate::error::StorageError;

const META_EXTENSION: &str = "meta";
const TEMP_SUFFIX: &str = ".tmp";

/// Local disk storage backend
///
/// Stores objects in a sharded directory structure:
/// `<base_path>/buckets/<bucket>/<first 2 chars>/<key>` for the payload and
/// `<key>.meta` next to it for the metadata record. The metadata file is
/// renamed into place last, so an object only becomes listable once its
/// payload is complete.
pub struct LocalStorage {
    buckets_path: PathBuf,
    capacity: Option<u64>,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let buckets_path = base_path.join("buckets");

        fs::create_dir_all(&buckets_path).await?;

        info!("Initialized local storage at {:?}", base_path);

        Ok(Self {
            buckets_path,
            capacity: None,
        })
    }

    /// Declare the capacity of the medium so `estimate_usage` can report a quota
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        validate_bucket(bucket)?;
        Ok(self.buckets_path.join(bucket))
    }

    /// Get the payload path for a key
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        let shard = &key[..2];
        Ok(self.bucket_path(bucket)?.join(shard).join(key))
    }

    fn meta_path(object_path: &Path) -> PathBuf {
        object_path.with_extension(META_EXTENSION)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    fn map_not_found(e: std::io::Error, bucket: &str, key: &str) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::not_found(bucket, key)
        } else {
            StorageError::Io(e)
        }
    }

    async fn dir_size(path: &Path) -> Result<u64, std::io::Error> {
        let mut total = 0u64;
        let mut pending = vec![path.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn read(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let path = self.object_path(bucket, key)?;
        debug!("Reading object from {:?}", path);

        let meta = fs::read(Self::meta_path(&path))
            .await
            .map_err(|e| Self::map_not_found(e, bucket, key))?;
        let body = fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(e, bucket, key))?;

        Ok(StoredObject {
            body: Bytes::from(body),
            meta: Bytes::from(meta),
        })
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        object: StoredObject,
    ) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        let meta_path = Self::meta_path(&path);
        debug!("Writing object to {:?} ({} bytes)", path, object.body.len());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write both temp files before renaming either into place
        let body_temp = Self::temp_path(&path);
        let meta_temp = Self::temp_path(&meta_path);
        fs::write(&body_temp, &object.body).await?;
        fs::write(&meta_temp, &object.meta).await?;
        fs::rename(&body_temp, &path).await?;
        fs::rename(&meta_temp, &meta_path).await?;

        Ok(())
    }

    async fn write_meta(&self, bucket: &str, key: &str, meta: Bytes) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::not_found(bucket, key));
        }

        let meta_path = Self::meta_path(&path);
        let meta_temp = Self::temp_path(&meta_path);
        fs::write(&meta_temp, &meta).await?;
        fs::rename(&meta_temp, &meta_path).await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(bucket, key)?;
        debug!("Deleting object at {:?}", path);

        // Metadata goes first so a half-deleted object is never listed
        match fs::remove_file(Self::meta_path(&path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, bucket: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let bucket_path = self.bucket_path(bucket)?;
        let mut objects = Vec::new();

        let mut shards = match fs::read_dir(&bucket_path).await {
            Ok(shards) => shards,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(objects),
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                    continue;
                }
                let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if validate_key(key).is_err() {
                    warn!("Ignoring unexpected file in bucket {}: {:?}", bucket, path);
                    continue;
                }

                let body_path = path.with_extension("");
                let size = match fs::metadata(&body_path).await {
                    Ok(m) => m.len(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!("Metadata without payload in bucket {}: {}", bucket, key);
                        continue;
                    }
                    Err(e) => return Err(StorageError::Io(e)),
                };

                let meta = fs::read(&path).await?;
                objects.push(ObjectMeta {
                    key: key.to_string(),
                    size,
                    meta: Bytes::from(meta),
                });
            }
        }

        Ok(objects)
    }

    async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let mut buckets = Vec::new();
        let mut entries = fs::read_dir(&self.buckets_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                buckets.push(name.to_string());
            }
        }

        buckets.sort();
        Ok(buckets)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<u64, StorageError> {
        let count = self.list(bucket).await?.len() as u64;
        let path = self.bucket_path(bucket)?;

        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!("Removed bucket {} ({} objects)", bucket, count);
                Ok(count)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn estimate_usage(&self) -> StorageEstimate {
        let Some(quota) = self.capacity else {
            return StorageEstimate::Unavailable;
        };

        match Self::dir_size(&self.buckets_path).await {
            Ok(used) => StorageEstimate::Available { used, quota },
            Err(e) => {
                warn!("Failed to estimate storage usage: {}", e);
                StorageEstimate::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ab12cd34";

    fn object(body: &'static [u8], meta: &'static [u8]) -> StoredObject {
        StoredObject {
            body: Bytes::from_static(body),
            meta: Bytes::from_static(meta),
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        storage
            .write("zim-packages-v1", KEY, object(b"payload", b"{}"))
            .await
            .unwrap();

        let stored = storage.read("zim-packages-v1", KEY).await.unwrap();
        assert_eq!(stored.body, Bytes::from_static(b"payload"));
        assert_eq!(stored.meta, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn test_write_replaces_previous_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        storage.write("b", KEY, object(b"old", b"1")).await.unwrap();
        storage.write("b", KEY, object(b"new!", b"2")).await.unwrap();

        let stored = storage.read("b", KEY).await.unwrap();
        assert_eq!(stored.body, Bytes::from_static(b"new!"));

        let listed = storage.list("b").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 4);
        assert_eq!(listed[0].meta, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let err = storage.read("b", KEY).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_write_meta_requires_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let err = storage
            .write_meta("b", KEY, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        storage.write("b", KEY, object(b"data", b"old")).await.unwrap();
        storage
            .write_meta("b", KEY, Bytes::from_static(b"new"))
            .await
            .unwrap();
        let stored = storage.read("b", KEY).await.unwrap();
        assert_eq!(stored.meta, Bytes::from_static(b"new"));
        assert_eq!(stored.body, Bytes::from_static(b"data"));
    }

    #[tokio::test]
    async fn test_delete_and_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        storage.write("a-v1", KEY, object(b"1", b"m")).await.unwrap();
        storage.write("a-v1", "ff00", object(b"2", b"m")).await.unwrap();
        storage.write("b-v1", KEY, object(b"3", b"m")).await.unwrap();

        assert_eq!(storage.list_buckets().await.unwrap(), vec!["a-v1", "b-v1"]);

        assert!(storage.delete("a-v1", KEY).await.unwrap());
        assert!(!storage.delete("a-v1", KEY).await.unwrap());
        assert_eq!(storage.list("a-v1").await.unwrap().len(), 1);

        assert_eq!(storage.delete_bucket("a-v1").await.unwrap(), 1);
        assert_eq!(storage.list_buckets().await.unwrap(), vec!["b-v1"]);
        assert!(storage.list("a-v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        assert!(storage.read("../escape", KEY).await.is_err());
        assert!(storage.read("b", "../../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_estimate_usage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        assert_eq!(storage.estimate_usage().await, StorageEstimate::Unavailable);

        let storage = storage.with_capacity(1000);
        storage.write("b", KEY, object(b"12345", b"67")).await.unwrap();
        assert_eq!(
            storage.estimate_usage().await,
            StorageEstimate::Available {
                used: 7,
                quota: 1000
            }
        );
    }
}
