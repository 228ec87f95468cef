//! Background refresh scheduling

mod scheduler;
mod task;

pub use scheduler::{ScheduleOutcome, SkipReason, SyncScheduler, spawn_sync_loop};
pub use task::{RefreshTask, SyncReport, SyncTask};
