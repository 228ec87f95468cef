//! Bucketed cache store
//!
//! Keeps an in-memory index of every bucket on top of a [`StorageBackend`].
//! Writes, reads and evictions of one key are serialized through a per-key
//! async lock; byte accounting of a bucket is serialized through the
//! bucket's own mutex, which is never held across an await.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use stash_storage::{StorageBackend, StoredObject};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CachedResponse, EntryMeta};
use super::policy::EvictionPolicy;
use crate::clock::Clock;
use crate::error::CoreError;

/// Byte usage of one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketUsage {
    pub bucket: String,
    pub quota: u64,
    pub used: u64,
    /// Bytes promised to inserts that haven't been written yet
    pub reserved: u64,
    pub entries: usize,
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub buckets: Vec<BucketUsage>,
}

struct BucketState {
    quota: u64,
    used: u64,
    reserved: u64,
    entries: HashMap<String, CacheEntry>,
}

impl BucketState {
    fn take(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.used = self.used.saturating_sub(entry.size);
        Some(entry)
    }
}

/// Space set aside in a bucket for one insert.
///
/// Consumed by [`CacheStore::put`]. Dropping it unused gives the space back.
pub struct Reservation {
    bucket: String,
    size: u64,
    state: Arc<Mutex<BucketState>>,
    committed: bool,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("bucket", &self.bucket)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            let mut state = self.state.lock();
            state.reserved = state.reserved.saturating_sub(self.size);
        }
    }
}

/// Per-key async locks, removed from the map once nobody holds or awaits them
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    async fn lock(&self, bucket: &str, key: &str) -> KeyGuard<'_> {
        let key = format!("{}/{}", bucket, key);
        let lock = Arc::clone(self.locks.lock().entry(key.clone()).or_default());
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Cache store partitioned into quota-bounded buckets
pub struct CacheStore {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    buckets: HashMap<String, Arc<Mutex<BucketState>>>,
    key_locks: KeyLocks,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Open the store over a backend.
    ///
    /// `buckets` lists every current bucket id with its quota. Buckets found
    /// in the backend but not listed belong to an older version and are
    /// deleted. The index of each listed bucket is rebuilt from the
    /// metadata stored with its objects.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        buckets: Vec<(String, u64)>,
    ) -> Result<Self, CoreError> {
        for present in backend.list_buckets().await? {
            if !buckets.iter().any(|(id, _)| *id == present) {
                let removed = backend.delete_bucket(&present).await?;
                info!("Retired bucket {} ({} entries)", present, removed);
            }
        }

        let mut states = HashMap::new();
        for (id, quota) in buckets {
            let entries = Self::load_bucket(backend.as_ref(), &id).await?;
            let used: u64 = entries.values().map(|e| e.size).sum();

            info!(
                "Opened bucket {} ({} entries, {} of {} bytes used)",
                id,
                entries.len(),
                used,
                quota
            );
            if used > quota {
                warn!(
                    "Bucket {} holds {} bytes, over its quota of {} bytes",
                    id, used, quota
                );
            }

            states.insert(
                id,
                Arc::new(Mutex::new(BucketState {
                    quota,
                    used,
                    reserved: 0,
                    entries,
                })),
            );
        }

        Ok(Self {
            backend,
            clock,
            buckets: states,
            key_locks: KeyLocks::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    async fn load_bucket(
        backend: &dyn StorageBackend,
        bucket: &str,
    ) -> Result<HashMap<String, CacheEntry>, CoreError> {
        let mut entries = HashMap::new();

        for object in backend.list(bucket).await? {
            match serde_json::from_slice::<CacheEntry>(&object.meta) {
                Ok(mut entry) => {
                    entry.key = object.key.clone();
                    entry.bucket = bucket.to_string();
                    entry.size = object.size;
                    entries.insert(object.key, entry);
                }
                Err(e) => {
                    warn!(
                        "Dropping {}/{} with unreadable metadata: {}",
                        bucket, object.key, e
                    );
                    if let Err(e) = backend.delete(bucket, &object.key).await {
                        warn!("Failed to delete {}/{}: {}", bucket, object.key, e);
                    }
                }
            }
        }

        Ok(entries)
    }

    fn bucket(&self, bucket: &str) -> Result<&Arc<Mutex<BucketState>>, CoreError> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| CoreError::UnknownBucket(bucket.to_string()))
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Ids of all open buckets, sorted
    pub fn bucket_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.buckets.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look up an entry. A hit refreshes its last-accessed time.
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedResponse>, CoreError> {
        let state = self.bucket(bucket)?;
        let _guard = self.key_locks.lock(bucket, key).await;

        if !state.lock().entries.contains_key(key) {
            self.record_miss();
            return Ok(None);
        }

        let object = match self.backend.read(bucket, key).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                warn!("Cache entry indexed but not in storage: {}/{}", bucket, key);
                state.lock().take(key);
                self.record_miss();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now();
        let entry = {
            let mut state = state.lock();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.last_accessed_at = now;
                    entry.access_count += 1;
                    entry.clone()
                }
                None => {
                    self.record_miss();
                    return Ok(None);
                }
            }
        };

        self.persist_meta(&entry).await;
        self.record_hit();

        Ok(Some(CachedResponse {
            entry,
            body: object.body,
        }))
    }

    /// Store an entry, replacing any previous entry under the same key
    pub async fn put(
        &self,
        mut reservation: Reservation,
        key: &str,
        body: Bytes,
        meta: EntryMeta,
    ) -> Result<CacheEntry, CoreError> {
        let size = body.len() as u64;
        if size > reservation.size {
            return Err(CoreError::ReservationTooSmall {
                reserved: reservation.size,
                size,
            });
        }

        let bucket = reservation.bucket.clone();
        let state = Arc::clone(&reservation.state);
        let _guard = self.key_locks.lock(&bucket, key).await;

        let now = self.clock.now();
        let entry = CacheEntry {
            key: key.to_string(),
            bucket: bucket.clone(),
            identifier: meta.identifier.clone(),
            category: meta.category,
            status: meta.status.as_u16(),
            headers: meta.header_pairs(),
            size,
            stored_at: now,
            last_accessed_at: now,
            access_count: 0,
            max_age: meta.max_age,
        };

        let encoded = serde_json::to_vec(&entry)?;
        self.backend
            .write(
                &bucket,
                key,
                StoredObject {
                    body,
                    meta: Bytes::from(encoded),
                },
            )
            .await?;

        let used = {
            let mut state = state.lock();
            state.reserved = state.reserved.saturating_sub(reservation.size);
            reservation.committed = true;
            if let Some(previous) = state.entries.insert(key.to_string(), entry.clone()) {
                state.used = state.used.saturating_sub(previous.size);
            }
            state.used += size;
            state.used
        };

        debug!("Cached {} in {} ({} bytes)", entry.identifier, bucket, size);
        report_usage(&bucket, used);
        Ok(entry)
    }

    /// Remove an entry, returning whether anything was there
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<bool, CoreError> {
        let state = self.bucket(bucket)?;
        let _guard = self.key_locks.lock(bucket, key).await;

        let indexed = state.lock().take(key).is_some();
        let stored = self.backend.delete(bucket, key).await?;

        debug!("Deleted cache entry {}/{}", bucket, key);
        report_usage(bucket, state.lock().used);
        Ok(indexed || stored)
    }

    /// Remove every entry of a bucket, returning how many were removed
    pub async fn clear_bucket(&self, bucket: &str) -> Result<u64, CoreError> {
        info!("Clearing bucket {}", bucket);

        let mut cleared = 0u64;
        for entry in self.list_by_recency(bucket)? {
            if self.evict(bucket, &entry).await?.is_some() {
                cleared += 1;
            }
        }

        info!("Cleared {} entries from {}", cleared, bucket);
        Ok(cleared)
    }

    /// Entries of a bucket, least recently accessed first
    pub fn list_by_recency(&self, bucket: &str) -> Result<Vec<CacheEntry>, CoreError> {
        let mut entries: Vec<CacheEntry> =
            self.bucket(bucket)?.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            (a.last_accessed_at, a.stored_at, &a.key).cmp(&(
                b.last_accessed_at,
                b.stored_at,
                &b.key,
            ))
        });
        Ok(entries)
    }

    /// Configured quota of a bucket
    pub fn quota(&self, bucket: &str) -> Result<u64, CoreError> {
        Ok(self.bucket(bucket)?.lock().quota)
    }

    pub fn usage(&self, bucket: &str) -> Result<BucketUsage, CoreError> {
        let state = self.bucket(bucket)?.lock();
        Ok(BucketUsage {
            bucket: bucket.to_string(),
            quota: state.quota,
            used: state.used,
            reserved: state.reserved,
            entries: state.entries.len(),
        })
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            buckets: self
                .bucket_ids()
                .iter()
                .filter_map(|id| self.usage(id).ok())
                .collect(),
        }
    }

    /// Bytes stored across every bucket
    pub fn total_used(&self) -> u64 {
        self.buckets.values().map(|state| state.lock().used).sum()
    }

    /// Set aside `size` bytes if they fit under `quota` next to what the
    /// bucket already uses and has reserved. With a `shared_limit`, the
    /// bytes must also fit next to what every bucket uses and has reserved.
    pub(crate) fn try_reserve(
        &self,
        bucket: &str,
        size: u64,
        quota: u64,
        shared_limit: Option<u64>,
    ) -> Result<Option<Reservation>, CoreError> {
        let target = Arc::clone(self.bucket(bucket)?);

        // Buckets are locked in id order; nothing else holds two at once
        let mut states: Vec<(&String, &Arc<Mutex<BucketState>>)> = self.buckets.iter().collect();
        states.sort_by(|a, b| a.0.cmp(b.0));
        let mut guards: Vec<_> = states
            .iter()
            .map(|(id, state)| (id.as_str(), state.lock()))
            .collect();

        let combined: u64 = guards.iter().map(|(_, g)| g.used + g.reserved).sum();
        if shared_limit.is_some_and(|limit| combined + size > limit) {
            return Ok(None);
        }

        let Some((_, guard)) = guards.iter_mut().find(|(id, _)| *id == bucket) else {
            return Err(CoreError::UnknownBucket(bucket.to_string()));
        };
        if guard.used + guard.reserved + size > quota {
            return Ok(None);
        }
        guard.reserved += size;
        drop(guards);

        Ok(Some(Reservation {
            bucket: bucket.to_string(),
            size,
            state: target,
            committed: false,
        }))
    }

    /// Pick the next victim among the entries matching `filter`
    pub(crate) fn select_victim<F>(
        &self,
        bucket: &str,
        policy: EvictionPolicy,
        filter: F,
    ) -> Result<Option<CacheEntry>, CoreError>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let state = self.bucket(bucket)?.lock();
        Ok(policy
            .next_victim(state.entries.values().filter(|&e| filter(e)))
            .cloned())
    }

    /// Pick the next victim across every bucket
    pub(crate) fn select_shared_victim(&self, policy: EvictionPolicy) -> Option<CacheEntry> {
        let candidates: Vec<CacheEntry> = self
            .buckets
            .values()
            .filter_map(|state| policy.next_victim(state.lock().entries.values()).cloned())
            .collect();
        policy.next_victim(&candidates).cloned()
    }

    /// Number of entries matching `filter`
    pub(crate) fn count_where<F>(&self, bucket: &str, filter: F) -> Result<usize, CoreError>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let state = self.bucket(bucket)?.lock();
        Ok(state.entries.values().filter(|&e| filter(e)).count())
    }

    /// Snapshot of the entries matching `filter`
    pub(crate) fn entries_where<F>(
        &self,
        bucket: &str,
        filter: F,
    ) -> Result<Vec<CacheEntry>, CoreError>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let state = self.bucket(bucket)?.lock();
        Ok(state.entries.values().filter(|&e| filter(e)).cloned().collect())
    }

    /// Remove `victim` if it is still the entry stored under its key.
    ///
    /// Returns `None` when the key was rewritten or removed in the meantime.
    /// A failure to delete the payload is logged; the bytes are no longer
    /// accounted either way.
    pub(crate) async fn evict(
        &self,
        bucket: &str,
        victim: &CacheEntry,
    ) -> Result<Option<CacheEntry>, CoreError> {
        let state = self.bucket(bucket)?;
        let _guard = self.key_locks.lock(bucket, &victim.key).await;

        let (removed, used) = {
            let mut state = state.lock();
            let unchanged = state
                .entries
                .get(&victim.key)
                .is_some_and(|current| current.stored_at == victim.stored_at);
            let removed = if unchanged {
                state.take(&victim.key)
            } else {
                None
            };
            (removed, state.used)
        };

        let Some(entry) = removed else {
            return Ok(None);
        };

        if let Err(e) = self.backend.delete(bucket, &entry.key).await {
            warn!(
                "Failed to delete evicted entry {}/{} from storage: {}",
                bucket, entry.key, e
            );
        }

        debug!("Evicted {} from {} ({} bytes)", entry.identifier, bucket, entry.size);
        report_usage(bucket, used);
        Ok(Some(entry))
    }

    /// Persist the index copy of an entry's metadata, best effort
    async fn persist_meta(&self, entry: &CacheEntry) {
        let encoded = match serde_json::to_vec(entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode metadata for {}: {}", entry.key, e);
                return;
            }
        };

        if let Err(e) = self
            .backend
            .write_meta(&entry.bucket, &entry.key, Bytes::from(encoded))
            .await
        {
            warn!(
                "Failed to update access time of {}/{}: {}",
                entry.bucket, entry.key, e
            );
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

fn report_usage(bucket: &str, used: u64) {
    metrics::gauge!("stash_storage_used_bytes", "bucket" => bucket.to_string()).set(used as f64);
}
