//! Minimum-interval task scheduling

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::task::{RefreshTask, SyncReport, SyncTask};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::dispatcher::Dispatcher;
use crate::error::CoreError;

/// Why a `schedule` call did not run its task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous run is younger than the minimum interval
    NotDue { remaining: Duration },
    /// A run of the same tag is still going
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Ran(SyncReport),
    Skipped(SkipReason),
}

struct TaskSlot {
    min_interval: Duration,
    task: Arc<dyn SyncTask>,
    running: tokio::sync::Mutex<()>,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

/// Runs named tasks no more often than their minimum interval
pub struct SyncScheduler {
    clock: Arc<dyn Clock>,
    tasks: RwLock<BTreeMap<String, Arc<TaskSlot>>>,
}

impl SyncScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    /// One refresh task per configured sync tag
    pub fn from_config(
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
        dispatcher: &Dispatcher,
    ) -> Self {
        let scheduler = Self::new(clock);
        for task in &config.sync {
            scheduler.register(
                task.tag.clone(),
                task.min_interval(),
                Arc::new(RefreshTask::new(dispatcher.clone(), task.resources.clone())),
            );
        }
        scheduler
    }

    /// Register a task, replacing any task with the same tag
    pub fn register(
        &self,
        tag: impl Into<String>,
        min_interval: Duration,
        task: Arc<dyn SyncTask>,
    ) {
        let tag = tag.into();
        info!(
            "Registered sync task {} (minimum interval {:?})",
            tag, min_interval
        );

        self.tasks.write().insert(
            tag,
            Arc::new(TaskSlot {
                min_interval,
                task,
                running: tokio::sync::Mutex::new(()),
                last_run: Mutex::new(None),
            }),
        );
    }

    /// Registered tags, sorted
    pub fn tags(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }

    /// Start time of the last run of `tag`, if it ever ran
    pub fn last_run(&self, tag: &str) -> Result<Option<DateTime<Utc>>, CoreError> {
        Ok(*self.slot(tag)?.last_run.lock())
    }

    fn slot(&self, tag: &str) -> Result<Arc<TaskSlot>, CoreError> {
        self.tasks
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| CoreError::UnknownTask(tag.to_string()))
    }

    /// Run the task for `tag` if its minimum interval has passed since its
    /// last run. A call that finds the tag already running skips at once.
    ///
    /// The last-run time is recorded whether the task succeeds or fails.
    pub async fn schedule(&self, tag: &str) -> Result<ScheduleOutcome, CoreError> {
        let slot = self.slot(tag)?;

        let Ok(_running) = slot.running.try_lock() else {
            debug!("Sync task {} is already running", tag);
            record_run(tag, "in_flight");
            return Ok(ScheduleOutcome::Skipped(SkipReason::InFlight));
        };

        let now = self.clock.now();
        let last_run = *slot.last_run.lock();
        if let Some(last_run) = last_run {
            let elapsed = (now - last_run).to_std().unwrap_or_default();
            if elapsed < slot.min_interval {
                let remaining = slot.min_interval - elapsed;
                debug!("Sync task {} not due for {:?}", tag, remaining);
                record_run(tag, "not_due");
                return Ok(ScheduleOutcome::Skipped(SkipReason::NotDue { remaining }));
            }
        }

        info!("Running sync task {}", tag);
        let result = slot.task.run().await;
        *slot.last_run.lock() = Some(now);

        match result {
            Ok(report) => {
                info!(
                    "Sync task {} complete: {} refreshed, {} failed",
                    tag, report.refreshed, report.failed
                );
                record_run(tag, "ran");
                Ok(ScheduleOutcome::Ran(report))
            }
            Err(e) => {
                warn!("Sync task {} failed: {}", tag, e);
                record_run(tag, "failed");
                Err(e)
            }
        }
    }
}

fn record_run(tag: &str, outcome: &'static str) {
    metrics::counter!(
        "stash_sync_runs_total",
        "tag" => tag.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Spawn a background task that offers every registered tag a run on each
/// tick. Tags that aren't due are skipped, not queued.
///
/// Runs happen inside the loop task, so aborting it also stops them.
pub fn spawn_sync_loop(
    scheduler: Arc<SyncScheduler>,
    tick: Duration,
) -> tokio::task::JoinHandle<()> {
    info!("Starting sync loop (tick: {:?})", tick);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let tags = scheduler.tags();
            join_all(tags.iter().map(|tag| {
                let scheduler = &scheduler;
                async move {
                    if let Err(e) = scheduler.schedule(tag).await {
                        warn!("Scheduled sync of {} failed: {}", tag, e);
                    }
                }
            }))
            .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct CountingTask {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl SyncTask for CountingTask {
        async fn run(&self) -> Result<SyncReport, CoreError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(SyncReport::default())
        }
    }

    /// Task that blocks until released
    #[derive(Default)]
    struct GatedTask {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SyncTask for GatedTask {
        async fn run(&self) -> Result<SyncReport, CoreError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(SyncReport::default())
        }
    }

    struct FailingTask;

    #[async_trait]
    impl SyncTask for FailingTask {
        async fn run(&self) -> Result<SyncReport, CoreError> {
            Err(CoreError::Config("boom".to_string()))
        }
    }

    const MINUTE: i64 = 60;

    #[tokio::test]
    async fn test_health_check_respects_minimum_interval() {
        let clock = Arc::new(ManualClock::default());
        let scheduler = SyncScheduler::new(clock.clone());
        let task = Arc::new(CountingTask::default());
        scheduler.register("health-check", Duration::from_secs(15 * 60), task.clone());

        let first = scheduler.schedule("health-check").await.unwrap();
        assert!(matches!(first, ScheduleOutcome::Ran(_)));

        clock.advance(chrono::Duration::seconds(10 * MINUTE));
        let second = scheduler.schedule("health-check").await.unwrap();
        assert_eq!(
            second,
            ScheduleOutcome::Skipped(SkipReason::NotDue {
                remaining: Duration::from_secs(5 * 60)
            })
        );

        clock.advance(chrono::Duration::seconds(6 * MINUTE));
        let third = scheduler.schedule("health-check").await.unwrap();
        assert!(matches!(third, ScheduleOutcome::Ran(_)));

        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_schedule_skips_in_flight_tag() {
        let scheduler = Arc::new(SyncScheduler::new(Arc::new(ManualClock::default())));
        let task = Arc::new(GatedTask::default());
        scheduler.register("content-update", Duration::ZERO, task.clone());

        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.schedule("content-update").await })
        };
        task.started.notified().await;

        assert_eq!(
            scheduler.schedule("content-update").await.unwrap(),
            ScheduleOutcome::Skipped(SkipReason::InFlight)
        );

        task.release.notify_one();
        assert!(matches!(
            running.await.unwrap().unwrap(),
            ScheduleOutcome::Ran(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_run_still_counts_as_run() {
        let clock = Arc::new(ManualClock::default());
        let scheduler = SyncScheduler::new(clock.clone());
        scheduler.register("content-update", Duration::from_secs(3600), Arc::new(FailingTask));

        assert!(scheduler.schedule("content-update").await.is_err());
        assert_eq!(
            scheduler.last_run("content-update").unwrap(),
            Some(clock.now())
        );
        assert!(matches!(
            scheduler.schedule("content-update").await.unwrap(),
            ScheduleOutcome::Skipped(SkipReason::NotDue { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let scheduler = SyncScheduler::new(Arc::new(ManualClock::default()));
        assert!(matches!(
            scheduler.schedule("nope").await,
            Err(CoreError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_registers_every_tag() {
        use crate::cache::{CacheStore, QuotaManager};
        use stash_fetch::{FetchError, FetchRequest, FetchResponse, Fetcher};
        use stash_storage::MemoryStorage;

        struct Offline;

        #[async_trait]
        impl Fetcher for Offline {
            async fn fetch(
                &self,
                _: &FetchRequest,
                _: Duration,
            ) -> Result<FetchResponse, FetchError> {
                Err(FetchError::InvalidRequest("offline".to_string()))
            }
        }

        let config = Arc::new(CacheConfig::default());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let store = Arc::new(
            CacheStore::open(Arc::new(MemoryStorage::new()), clock.clone(), config.bucket_quotas())
                .await
                .unwrap(),
        );
        let quota = Arc::new(QuotaManager::new(store.clone(), config.clone()));
        let dispatcher = Dispatcher::new(config.clone(), store, quota, Arc::new(Offline));

        let scheduler = SyncScheduler::from_config(&config, clock, &dispatcher);
        assert_eq!(scheduler.tags(), vec!["content-update", "health-check"]);
        assert!(matches!(
            scheduler.schedule("health-check").await.unwrap(),
            ScheduleOutcome::Ran(SyncReport { refreshed: 0, failed: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_loop_offers_every_tick() {
        let scheduler = Arc::new(SyncScheduler::new(Arc::new(ManualClock::default())));
        let task = Arc::new(CountingTask::default());
        scheduler.register("content-update", Duration::ZERO, task.clone());

        let handle = spawn_sync_loop(scheduler, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(150)).await;
        handle.abort();

        // ticks at 0s, 60s and 120s
        assert_eq!(task.runs.load(Ordering::SeqCst), 3);
    }

    /// Task that takes ten minutes
    #[derive(Default)]
    struct SlowTask {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl SyncTask for SlowTask {
        async fn run(&self) -> Result<SyncReport, CoreError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(600)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(SyncReport::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborting_sync_loop_stops_running_tasks() {
        let scheduler = Arc::new(SyncScheduler::new(Arc::new(ManualClock::default())));
        let task = Arc::new(SlowTask::default());
        scheduler.register("content-update", Duration::ZERO, task.clone());

        let handle = spawn_sync_loop(scheduler, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(task.started.load(Ordering::SeqCst), 1);

        handle.abort();
        tokio::time::sleep(Duration::from_secs(1200)).await;

        assert_eq!(task.finished.load(Ordering::SeqCst), 0);
        // the aborted run released the task it held
        assert_eq!(Arc::strong_count(&task), 1);
    }
}
