//! Quota enforcement and maintenance

use parking_lot::RwLock;
use serde::Serialize;
use stash_storage::StorageEstimate;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::store::{CacheStore, Reservation};
use crate::classifier::ContentCategory;
use crate::config::CacheConfig;
use crate::error::CoreError;

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Entries removed for outliving their age policy
    pub expired: u64,
    /// Entries removed to respect per-category entry limits
    pub trimmed: u64,
    /// Bytes freed to bring buckets back under quota
    pub freed_bytes: u64,
}

/// Keeps every bucket within its byte quota, and all buckets together
/// within what the device can hold.
///
/// Quota pressure evicts any entry, including ones whose age policy is
/// unlimited. Age policy only drives [`QuotaManager::cleanup_expired`].
pub struct QuotaManager {
    store: Arc<CacheStore>,
    config: Arc<CacheConfig>,
    /// Bytes the buckets may fill together, from the storage estimate
    device_limit: RwLock<Option<u64>>,
}

impl QuotaManager {
    pub fn new(store: Arc<CacheStore>, config: Arc<CacheConfig>) -> Self {
        info!(
            "Quota manager initialized (eviction policy: {})",
            config.eviction_policy.as_str()
        );

        Self {
            store,
            config,
            device_limit: RwLock::new(None),
        }
    }

    /// Take the storage collaborator's usage estimate into account.
    ///
    /// With an available estimate, whatever the device reports as used
    /// beyond the bucket entries is held back, and the buckets share the
    /// rest of the device quota. An unavailable estimate leaves the
    /// configured bucket quotas in charge.
    pub fn seed(&self, estimate: StorageEstimate) {
        match estimate {
            StorageEstimate::Available { used, quota } => {
                let tracked = self.store.total_used();
                let foreign = used.saturating_sub(tracked);
                let limit = quota.saturating_sub(foreign);
                info!(
                    "Storage estimate: {} of {} bytes used ({} outside the cache)",
                    used, quota, foreign
                );
                info!("Buckets may hold {} bytes together", limit);
                metrics::gauge!("stash_storage_used_bytes", "bucket" => "device").set(used as f64);
                *self.device_limit.write() = Some(limit);
            }
            StorageEstimate::Unavailable => {
                info!("Storage estimate unavailable, using tracked bucket totals");
                *self.device_limit.write() = None;
            }
        }
    }

    /// Bytes all buckets may hold together, if the device reported a quota
    pub fn device_limit(&self) -> Option<u64> {
        *self.device_limit.read()
    }

    /// Quota of a bucket after the device ceiling is applied
    pub fn effective_quota(&self, bucket: &str) -> Result<u64, CoreError> {
        let quota = self.store.quota(bucket)?;
        Ok(match self.device_limit() {
            Some(limit) => quota.min(limit),
            None => quota,
        })
    }

    /// Make room for `incoming` bytes in `bucket`, evicting entries as needed.
    ///
    /// Rejects up front, without evicting anything, when `incoming` alone
    /// exceeds the quota. When the bucket has room but the device does
    /// not, the victim is picked across all buckets.
    pub async fn reserve(&self, bucket: &str, incoming: u64) -> Result<Reservation, CoreError> {
        let quota = self.effective_quota(bucket)?;
        let shared_limit = self.device_limit();
        let policy = self.config.eviction_policy;

        if incoming > quota {
            warn!(
                "Entry of {} bytes can never fit in {} (quota {} bytes)",
                incoming, bucket, quota
            );
            return Err(CoreError::QuotaExceeded {
                bucket: bucket.to_string(),
                size: incoming,
                quota,
            });
        }

        loop {
            if let Some(reservation) = self
                .store
                .try_reserve(bucket, incoming, quota, shared_limit)?
            {
                return Ok(reservation);
            }

            let usage = self.store.usage(bucket)?;
            let (victim, reason) = if usage.used + usage.reserved + incoming > quota {
                (self.store.select_victim(bucket, policy, |_| true)?, "quota")
            } else {
                (self.store.select_shared_victim(policy), "device_quota")
            };

            let Some(victim) = victim else {
                warn!(
                    "No room for {} bytes in {}: remaining space is reserved by in-flight inserts",
                    incoming, bucket
                );
                return Err(CoreError::QuotaExceeded {
                    bucket: bucket.to_string(),
                    size: incoming,
                    quota,
                });
            };

            self.evict(&victim.bucket, &victim, reason).await?;
        }
    }

    /// Remove every entry that outlived its age policy
    pub async fn cleanup_expired(&self) -> Result<u64, CoreError> {
        let now = self.store.now();
        let mut cleaned = 0u64;

        for bucket in self.store.bucket_ids() {
            for entry in self.store.entries_where(&bucket, |e| e.is_expired(now))? {
                if self.evict(&bucket, &entry, "expired").await? {
                    cleaned += 1;
                }
            }
        }

        info!("Cleaned up {} expired entries", cleaned);
        Ok(cleaned)
    }

    /// Trim one category down to its rule's `max_entries`
    pub async fn enforce_entry_limit(&self, category: ContentCategory) -> Result<u64, CoreError> {
        let rule = self.config.strategies.resolve(category);
        let bucket = self.config.bucket_id(&rule.bucket);
        let in_category = |e: &CacheEntry| e.category == category;
        let mut trimmed = 0u64;

        while self.store.count_where(&bucket, in_category)? > rule.max_entries {
            let victim =
                self.store
                    .select_victim(&bucket, self.config.eviction_policy, in_category)?;
            let Some(victim) = victim else {
                break;
            };
            if self.evict(&bucket, &victim, "entry_limit").await? {
                trimmed += 1;
            }
        }

        if trimmed > 0 {
            debug!(
                "Trimmed {} {} entries to respect the limit of {}",
                trimmed, category, rule.max_entries
            );
        }
        Ok(trimmed)
    }

    /// Trim every category down to its entry limit
    pub async fn enforce_entry_limits(&self) -> Result<u64, CoreError> {
        let mut trimmed = 0u64;
        for category in ContentCategory::ALL {
            trimmed += self.enforce_entry_limit(category).await?;
        }
        Ok(trimmed)
    }

    /// Evict until every bucket is within its effective quota and all of
    /// them together within the device limit.
    ///
    /// Needed after the quota shrinks, e.g. once a device estimate arrives.
    pub async fn enforce_quota(&self) -> Result<u64, CoreError> {
        let mut freed = 0u64;

        for bucket in self.store.bucket_ids() {
            let quota = self.effective_quota(&bucket)?;

            while self.store.usage(&bucket)?.used > quota {
                let victim = self
                    .store
                    .select_victim(&bucket, self.config.eviction_policy, |_| true)?;
                let Some(victim) = victim else {
                    break;
                };
                if self.evict(&bucket, &victim, "quota").await? {
                    freed += victim.size;
                }
            }
        }

        if let Some(limit) = self.device_limit() {
            while self.store.total_used() > limit {
                let Some(victim) = self.store.select_shared_victim(self.config.eviction_policy)
                else {
                    break;
                };
                if self.evict(&victim.bucket, &victim, "device_quota").await? {
                    freed += victim.size;
                }
            }
        }

        if freed > 0 {
            info!("Freed {} bytes to bring buckets under quota", freed);
        }
        Ok(freed)
    }

    /// Run full maintenance: expired entries, entry limits, then quotas
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, CoreError> {
        info!("Running cache maintenance");

        let report = MaintenanceReport {
            expired: self.cleanup_expired().await?,
            trimmed: self.enforce_entry_limits().await?,
            freed_bytes: self.enforce_quota().await?,
        };

        info!(
            "Maintenance complete: {} expired, {} trimmed, {} bytes freed",
            report.expired, report.trimmed, report.freed_bytes
        );
        Ok(report)
    }

    async fn evict(
        &self,
        bucket: &str,
        victim: &CacheEntry,
        reason: &'static str,
    ) -> Result<bool, CoreError> {
        let evicted = self.store.evict(bucket, victim).await?.is_some();
        if evicted {
            metrics::counter!(
                "stash_evictions_total",
                "bucket" => bucket.to_string(),
                "reason" => reason
            )
            .increment(1);
        }
        Ok(evicted)
    }
}

/// Spawn a background task that runs cache maintenance periodically
pub fn spawn_maintenance_task(
    quota: Arc<QuotaManager>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        "Starting background cache maintenance task (interval: {:?})",
        interval
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        // Skip the first tick (which fires immediately)
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Err(e) = quota.run_maintenance().await {
                warn!("Error during scheduled maintenance: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{EntryMeta, cache_key};
    use crate::clock::ManualClock;
    use crate::config::BucketConfig;
    use crate::strategy::{MaxAge, STATIC_BUCKET, ZIM_BUCKET};
    use bytes::Bytes;
    use chrono::Duration;
    use http::{HeaderMap, StatusCode};
    use stash_storage::MemoryStorage;

    const ZIM: &str = "zim-packages-v1";
    const STATIC: &str = "static-assets-v1";

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<CacheStore>,
        quota: QuotaManager,
    }

    async fn fixture(zim_quota: u64, static_quota: u64) -> Fixture {
        let mut config = CacheConfig::default();
        config.buckets = vec![
            BucketConfig {
                name: ZIM_BUCKET.to_string(),
                quota_bytes: zim_quota,
            },
            BucketConfig {
                name: STATIC_BUCKET.to_string(),
                quota_bytes: static_quota,
            },
        ];
        let config = Arc::new(config);
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(
            CacheStore::open(
                Arc::new(MemoryStorage::new()),
                clock.clone(),
                config.bucket_quotas(),
            )
            .await
            .unwrap(),
        );
        let quota = QuotaManager::new(store.clone(), config);
        Fixture {
            clock,
            store,
            quota,
        }
    }

    impl Fixture {
        async fn insert(
            &self,
            bucket: &str,
            identifier: &str,
            category: ContentCategory,
            size: usize,
        ) {
            let max_age = match category {
                ContentCategory::Zim => MaxAge::Unlimited,
                _ => MaxAge::days(1),
            };
            let reservation = self.quota.reserve(bucket, size as u64).await.unwrap();
            self.store
                .put(
                    reservation,
                    &cache_key(identifier),
                    Bytes::from(vec![b'x'; size]),
                    EntryMeta {
                        identifier: identifier.to_string(),
                        category,
                        status: StatusCode::OK,
                        headers: HeaderMap::new(),
                        max_age,
                    },
                )
                .await
                .unwrap();
            self.clock.advance(Duration::seconds(1));
        }

        fn identifiers(&self, bucket: &str) -> Vec<String> {
            self.store
                .list_by_recency(bucket)
                .unwrap()
                .into_iter()
                .map(|e| e.identifier)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_reserve_within_quota_evicts_nothing() {
        let f = fixture(100, 100).await;
        f.insert(STATIC, "/a.js", ContentCategory::Static, 40).await;
        f.insert(STATIC, "/b.js", ContentCategory::Static, 40).await;
        assert_eq!(f.identifiers(STATIC), vec!["/a.js", "/b.js"]);
    }

    #[tokio::test]
    async fn test_reserve_evicts_least_recently_used() {
        let f = fixture(100, 100).await;
        f.insert(STATIC, "/t1.js", ContentCategory::Static, 30).await;
        f.insert(STATIC, "/t2.js", ContentCategory::Static, 30).await;
        f.insert(STATIC, "/t3.js", ContentCategory::Static, 30).await;

        f.insert(STATIC, "/new.js", ContentCategory::Static, 30).await;

        assert_eq!(f.identifiers(STATIC), vec!["/t2.js", "/t3.js", "/new.js"]);
        assert!(f.store.usage(STATIC).unwrap().used <= 100);
    }

    #[tokio::test]
    async fn test_recent_access_protects_entry() {
        let f = fixture(100, 100).await;
        f.insert(STATIC, "/t1.js", ContentCategory::Static, 50).await;
        f.insert(STATIC, "/t2.js", ContentCategory::Static, 50).await;
        f.store.get(STATIC, &cache_key("/t1.js")).await.unwrap();

        f.insert(STATIC, "/t3.js", ContentCategory::Static, 50).await;
        assert_eq!(f.identifiers(STATIC), vec!["/t1.js", "/t3.js"]);
    }

    #[tokio::test]
    async fn test_unlimited_entries_are_evicted_under_pressure() {
        let f = fixture(100, 100).await;
        f.insert(ZIM, "/a.zim", ContentCategory::Zim, 60).await;
        f.insert(ZIM, "/b.zim", ContentCategory::Zim, 60).await;
        assert_eq!(f.identifiers(ZIM), vec!["/b.zim"]);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_rejected_without_evicting() {
        let f = fixture(100, 100).await;
        f.insert(STATIC, "/a.js", ContentCategory::Static, 60).await;

        let err = f.quota.reserve(STATIC, 101).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::QuotaExceeded { size: 101, quota: 100, .. }
        ));
        assert_eq!(f.identifiers(STATIC), vec!["/a.js"]);
    }

    #[tokio::test]
    async fn test_outstanding_reservations_count_as_used() {
        let f = fixture(100, 100).await;
        let held = f.quota.reserve(STATIC, 80).await.unwrap();

        assert!(matches!(
            f.quota.reserve(STATIC, 30).await,
            Err(CoreError::QuotaExceeded { .. })
        ));

        drop(held);
        assert!(f.quota.reserve(STATIC, 30).await.is_ok());
    }

    #[tokio::test]
    async fn test_quota_invariant_over_many_inserts() {
        let f = fixture(1000, 1000).await;
        let sizes = [120, 700, 5, 333, 999, 1, 450, 450, 450, 80, 1000, 17];

        for (i, size) in sizes.into_iter().enumerate() {
            f.insert(STATIC, &format!("/{}.js", i), ContentCategory::Static, size)
                .await;
            let usage = f.store.usage(STATIC).unwrap();
            assert!(usage.used <= 1000, "used {} after insert {}", usage.used, i);
            assert_eq!(usage.reserved, 0);
        }
    }

    #[tokio::test]
    async fn test_device_estimate_caps_quota() {
        let f = fixture(1000, 1000).await;
        f.insert(STATIC, "/a.js", ContentCategory::Static, 300).await;
        f.insert(STATIC, "/b.js", ContentCategory::Static, 300).await;

        f.quota.seed(StorageEstimate::Available {
            used: 600,
            quota: 400,
        });
        assert_eq!(f.quota.effective_quota(STATIC).unwrap(), 400);

        let freed = f.quota.enforce_quota().await.unwrap();
        assert_eq!(freed, 300);
        assert_eq!(f.identifiers(STATIC), vec!["/b.js"]);

        f.quota.seed(StorageEstimate::Unavailable);
        assert_eq!(f.quota.effective_quota(STATIC).unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_device_quota_is_shared_across_buckets() {
        let f = fixture(1000, 1000).await;
        f.quota.seed(StorageEstimate::Available { used: 0, quota: 100 });

        f.insert(ZIM, "/a.zim", ContentCategory::Zim, 85).await;
        f.insert(STATIC, "/b.css", ContentCategory::Static, 85).await;

        assert!(f.identifiers(ZIM).is_empty());
        assert_eq!(f.identifiers(STATIC), vec!["/b.css"]);
        assert_eq!(f.store.total_used(), 85);
    }

    #[tokio::test]
    async fn test_usage_outside_buckets_shrinks_device_limit() {
        let f = fixture(1000, 1000).await;
        f.insert(STATIC, "/a.js", ContentCategory::Static, 300).await;

        // 200 bytes on the device belong to something else
        f.quota.seed(StorageEstimate::Available {
            used: 500,
            quota: 600,
        });
        assert_eq!(f.quota.device_limit(), Some(400));
        assert_eq!(f.quota.effective_quota(ZIM).unwrap(), 400);

        f.insert(ZIM, "/b.zim", ContentCategory::Zim, 50).await;
        assert_eq!(f.identifiers(STATIC), vec!["/a.js"]);

        f.insert(ZIM, "/c.zim", ContentCategory::Zim, 100).await;
        assert!(f.identifiers(STATIC).is_empty());
        assert_eq!(f.identifiers(ZIM), vec!["/b.zim", "/c.zim"]);
        assert!(f.store.total_used() <= 400);
    }

    #[tokio::test]
    async fn test_enforce_quota_applies_device_limit_across_buckets() {
        let f = fixture(1000, 1000).await;
        f.insert(ZIM, "/a.zim", ContentCategory::Zim, 60).await;
        f.insert(STATIC, "/b.js", ContentCategory::Static, 60).await;

        f.quota.seed(StorageEstimate::Available {
            used: 120,
            quota: 100,
        });
        assert_eq!(f.quota.enforce_quota().await.unwrap(), 60);
        assert!(f.identifiers(ZIM).is_empty());
        assert_eq!(f.identifiers(STATIC), vec!["/b.js"]);
    }

    #[tokio::test]
    async fn test_cleanup_expired_skips_unlimited() {
        let f = fixture(1000, 1000).await;
        f.insert(ZIM, "/a.zim", ContentCategory::Zim, 10).await;
        f.insert(STATIC, "/data.json", ContentCategory::Json, 10).await;

        f.clock.advance(Duration::days(2));
        assert_eq!(f.quota.cleanup_expired().await.unwrap(), 1);
        assert_eq!(f.identifiers(ZIM), vec!["/a.zim"]);
        assert!(f.identifiers(STATIC).is_empty());
    }

    #[tokio::test]
    async fn test_entry_limit_trims_only_its_category() {
        let f = fixture(1000, 1000).await;
        // zim allows five entries
        for i in 0..7 {
            f.insert(ZIM, &format!("/{}.zim", i), ContentCategory::Zim, 1).await;
        }
        f.insert(STATIC, "/a.js", ContentCategory::Static, 1).await;

        assert_eq!(f.quota.enforce_entry_limit(ContentCategory::Zim).await.unwrap(), 2);
        assert_eq!(
            f.identifiers(ZIM),
            vec!["/2.zim", "/3.zim", "/4.zim", "/5.zim", "/6.zim"]
        );
        assert_eq!(f.quota.enforce_entry_limits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_maintenance_report() {
        let f = fixture(1000, 1000).await;
        f.insert(STATIC, "/old.html", ContentCategory::Page, 10).await;
        f.clock.advance(Duration::days(3));
        f.insert(STATIC, "/new.html", ContentCategory::Page, 10).await;

        let report = f.quota.run_maintenance().await.unwrap();
        assert_eq!(
            report,
            MaintenanceReport {
                expired: 1,
                trimmed: 0,
                freed_bytes: 0
            }
        );
    }
}
