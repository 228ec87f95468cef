//! Cache management module

mod entry;
mod policy;
mod quota;
mod store;

pub use entry::{CacheEntry, CachedResponse, EntryMeta, bucket_id, cache_key};
pub use policy::{EvictionPolicy, ParseEvictionPolicyError};
pub use quota::{MaintenanceReport, QuotaManager, spawn_maintenance_task};
pub use store::{BucketUsage, CacheStats, CacheStore, Reservation};
