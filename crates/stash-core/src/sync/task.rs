//! Background sync tasks

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::CoreError;

/// Outcome of one task run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub refreshed: usize,
    pub failed: usize,
}

/// Body of a scheduled background task
#[async_trait]
pub trait SyncTask: Send + Sync {
    async fn run(&self) -> Result<SyncReport, CoreError>;
}

/// Re-fetches a fixed set of resources through the dispatcher
pub struct RefreshTask {
    dispatcher: Dispatcher,
    resources: Vec<String>,
}

impl RefreshTask {
    pub fn new(dispatcher: Dispatcher, resources: Vec<String>) -> Self {
        Self {
            dispatcher,
            resources,
        }
    }
}

#[async_trait]
impl SyncTask for RefreshTask {
    async fn run(&self) -> Result<SyncReport, CoreError> {
        let results = futures::future::join_all(
            self.resources
                .iter()
                .map(|identifier| self.dispatcher.refresh(identifier)),
        )
        .await;

        let mut report = SyncReport::default();
        for (identifier, result) in self.resources.iter().zip(results) {
            match result {
                Ok(response) => {
                    debug!("Refreshed {} (status {})", identifier, response.status);
                    report.refreshed += 1;
                }
                Err(e) => {
                    warn!("Failed to refresh {}: {}", identifier, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
