//! Timeouts and backoff for network attempts

use serde::{Deserialize, Serialize};
use stash_fetch::FetchError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per logical fetch, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further failure
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Declared sizes below this are small
    #[serde(default = "default_small_threshold")]
    pub small_threshold: u64,
    /// Declared sizes below this (and not small) are medium; the rest are large
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: u64,
    #[serde(default = "default_small_timeout_ms")]
    pub small_timeout_ms: u64,
    #[serde(default = "default_medium_timeout_ms")]
    pub medium_timeout_ms: u64,
    #[serde(default = "default_large_timeout_ms")]
    pub large_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            small_threshold: default_small_threshold(),
            medium_threshold: default_medium_threshold(),
            small_timeout_ms: default_small_timeout_ms(),
            medium_timeout_ms: default_medium_timeout_ms(),
            large_timeout_ms: default_large_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_small_threshold() -> u64 {
    10 * 1024 // 10 KB
}

fn default_medium_threshold() -> u64 {
    500 * 1024 // 500 KB
}

fn default_small_timeout_ms() -> u64 {
    5_000
}

fn default_medium_timeout_ms() -> u64 {
    10_000
}

fn default_large_timeout_ms() -> u64 {
    30_000
}

/// Chooses per-attempt timeouts and the delay between attempts
#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Timeout for one attempt, tiered by the declared size of the resource.
    /// An unknown size gets the large tier.
    pub fn timeout_for(&self, declared_size: Option<u64>) -> Duration {
        let millis = match declared_size {
            Some(size) if size < self.config.small_threshold => self.config.small_timeout_ms,
            Some(size) if size < self.config.medium_threshold => self.config.medium_timeout_ms,
            _ => self.config.large_timeout_ms,
        };
        Duration::from_millis(millis)
    }

    /// Delay to wait after failed attempt number `attempt` (counted from 0)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.base_delay_ms);
        let max = Duration::from_millis(self.config.max_delay_ms);
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(max)
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is used up. Each attempt is cancelled once it runs
    /// longer than `timeout`, which counts as a retryable failure.
    pub async fn run<T, F, Fut>(&self, timeout: Duration, mut attempt: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut tries = 0u32;

        loop {
            let result = match tokio::time::timeout(timeout, attempt(tries)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout)),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() {
                debug!("Attempt {} failed permanently: {}", tries + 1, error);
                return Err(error);
            }

            tries += 1;
            if tries >= self.config.max_attempts {
                warn!("Giving up after {} attempts: {}", tries, error);
                return Err(error);
            }

            let delay = self.next_delay(tries - 1);
            debug!(
                "Attempt {} failed ({}), retrying in {:?}",
                tries, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
