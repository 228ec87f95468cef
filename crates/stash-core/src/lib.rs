//! Stash Core Policy Engine
//!
//! This crate decides, per requested resource, how offline content is
//! retrieved, stored, evicted and refreshed: content classification,
//! cache-first and network-first strategies, quota-aware eviction,
//! retries with size-tiered timeouts, and minimum-interval background sync.

pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod filter;
pub mod logging;
pub mod retry;
pub mod strategy;
pub mod sync;

pub use cache::{
    BucketUsage, CacheEntry, CacheStats, CacheStore, EvictionPolicy, MaintenanceReport,
    QuotaManager, Reservation, cache_key, spawn_maintenance_task,
};
pub use classifier::{ContentCategory, classify};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BucketConfig, CacheConfig, LoggingConfig, SyncTaskConfig};
pub use dispatcher::{
    Dispatcher, Resolution, ResourceRequest, ResourceResponse, ResponseSource, should_cache,
};
pub use engine::{BackgroundTasks, CacheEngine};
pub use error::CoreError;
pub use filter::{ContentFilter, ContentSet, FilterConfig};
pub use logging::init_logging;
pub use retry::{RetryConfig, RetryController};
pub use strategy::{MaxAge, StrategyKind, StrategyRule, StrategyTable};
pub use sync::{
    RefreshTask, ScheduleOutcome, SkipReason, SyncReport, SyncScheduler, SyncTask, spawn_sync_loop,
};
