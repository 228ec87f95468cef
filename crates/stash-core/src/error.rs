//! Core error types

use stash_fetch::FetchError;
use stash_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Network error: {0}")]
    Network(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Quota exceeded in bucket {bucket}: {size} bytes requested, quota is {quota} bytes")]
    QuotaExceeded { bucket: String, size: u64, quota: u64 },

    #[error("Reservation of {reserved} bytes can't hold {size} bytes")]
    ReservationTooSmall { reserved: u64, size: u64 },

    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("Unknown sync task: {0}")]
    UnknownTask(String),

    #[error("Invalid entry metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
