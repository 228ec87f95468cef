//! Engine assembly
//!
//! Builds every component from one configuration value and owns the
//! background tasks.

use stash_fetch::Fetcher;
use stash_storage::StorageBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheStats, CacheStore, QuotaManager, spawn_maintenance_task};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::dispatcher::{Dispatcher, Resolution, ResourceRequest};
use crate::error::CoreError;
use crate::sync::{SyncScheduler, spawn_sync_loop};

/// Fully wired cache engine
pub struct CacheEngine {
    config: Arc<CacheConfig>,
    store: Arc<CacheStore>,
    quota: Arc<QuotaManager>,
    dispatcher: Dispatcher,
    scheduler: Arc<SyncScheduler>,
}

impl CacheEngine {
    /// Validate the configuration, open the store (retiring buckets of older
    /// versions), seed quotas from the storage estimate and register the
    /// configured sync tasks.
    pub async fn open(
        config: CacheConfig,
        backend: Arc<dyn StorageBackend>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let config = Arc::new(config);
        info!("Opening cache engine (bucket version {})", config.version);

        let store = Arc::new(
            CacheStore::open(backend.clone(), clock.clone(), config.bucket_quotas()).await?,
        );

        let quota = Arc::new(QuotaManager::new(store.clone(), config.clone()));
        quota.seed(backend.estimate_usage().await);
        quota.enforce_quota().await?;

        let dispatcher = Dispatcher::new(config.clone(), store.clone(), quota.clone(), fetcher);
        let scheduler = Arc::new(SyncScheduler::from_config(&config, clock, &dispatcher));

        Ok(Self {
            config,
            store,
            quota,
            dispatcher,
            scheduler,
        })
    }

    pub async fn dispatch(&self, request: &ResourceRequest) -> Result<Resolution, CoreError> {
        self.dispatcher.dispatch(request).await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Start periodic maintenance and the sync loop
    pub fn spawn_background_tasks(&self) -> BackgroundTasks {
        let maintenance = spawn_maintenance_task(
            self.quota.clone(),
            Duration::from_secs(self.config.maintenance.interval_secs),
        );
        let sync = spawn_sync_loop(
            self.scheduler.clone(),
            Duration::from_secs(self.config.scheduler.tick_secs),
        );

        BackgroundTasks {
            handles: vec![maintenance, sync],
        }
    }
}

/// Handles of the engine's background tasks; aborted on drop
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        info!("Stopping background tasks");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
