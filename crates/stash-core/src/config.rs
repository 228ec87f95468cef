//! Engine configuration
//!
//! A single immutable value built once at startup and handed to every
//! component by `Arc`. Every field has a default, so an empty or missing
//! file yields a working configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::cache::{EvictionPolicy, bucket_id};
use crate::error::CoreError;
use crate::filter::FilterConfig;
use crate::retry::RetryConfig;
use crate::strategy::{STATIC_BUCKET, StrategyTable, ZIM_BUCKET};

pub const CONTENT_UPDATE_TAG: &str = "content-update";
pub const HEALTH_CHECK_TAG: &str = "health-check";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Version token embedded in every bucket id
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,
    #[serde(default = "default_buckets")]
    pub buckets: Vec<BucketConfig>,
    #[serde(default)]
    pub strategies: StrategyTable,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_sync_tasks")]
    pub sync: Vec<SyncTaskConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Packaging filter; not used by the engine itself
    #[serde(default)]
    pub filter: FilterConfig,
}

/// A quota-bounded bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketConfig {
    /// Name without the version suffix
    pub name: String,
    pub quota_bytes: u64,
}

/// A named background refresh task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncTaskConfig {
    pub tag: String,
    pub min_interval_secs: u64,
    /// Identifiers re-fetched on every run
    #[serde(default)]
    pub resources: Vec<String>,
}

impl SyncTaskConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How often every sync tag is offered a run
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceConfig {
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Upper bound on concurrent network fetches; defaults to the
    /// available parallelism
    #[serde(default)]
    pub max_fetches: Option<usize>,
}

impl ConcurrencyConfig {
    pub fn max_fetches(&self) -> usize {
        self.max_fetches.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            eviction_policy: EvictionPolicy::default(),
            buckets: default_buckets(),
            strategies: StrategyTable::default(),
            retry: RetryConfig::default(),
            sync: default_sync_tasks(),
            scheduler: SchedulerConfig::default(),
            maintenance: MaintenanceConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            logging: LoggingConfig::default(),
            filter: FilterConfig::default(),
        }
    }
}

fn default_version() -> String {
    "1".to_string()
}

fn default_buckets() -> Vec<BucketConfig> {
    vec![
        BucketConfig {
            name: ZIM_BUCKET.to_string(),
            quota_bytes: 500 * 1024 * 1024, // 500 MB
        },
        BucketConfig {
            name: STATIC_BUCKET.to_string(),
            quota_bytes: 100 * 1024 * 1024, // 100 MB
        },
    ]
}

fn default_sync_tasks() -> Vec<SyncTaskConfig> {
    vec![
        SyncTaskConfig {
            tag: CONTENT_UPDATE_TAG.to_string(),
            min_interval_secs: 60 * 60,
            resources: vec![],
        },
        SyncTaskConfig {
            tag: HEALTH_CHECK_TAG.to_string(),
            min_interval_secs: 15 * 60,
            resources: vec![],
        },
    ]
}

fn default_tick_secs() -> u64 {
    60
}

fn default_maintenance_interval_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl CacheConfig {
    /// Load configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules that serde can't express
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut names = HashSet::new();
        for bucket in &self.buckets {
            if !names.insert(bucket.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "Duplicate bucket name: {}",
                    bucket.name
                )));
            }
            if bucket.quota_bytes == 0 {
                return Err(CoreError::Config(format!(
                    "Bucket {} has a zero quota",
                    bucket.name
                )));
            }
        }

        for (category, rule) in self.strategies.iter() {
            if !names.contains(rule.bucket.as_str()) {
                return Err(CoreError::Config(format!(
                    "Strategy for {} uses unknown bucket {}",
                    category, rule.bucket
                )));
            }
        }

        let mut tags = HashSet::new();
        for task in &self.sync {
            if !tags.insert(task.tag.as_str()) {
                return Err(CoreError::Config(format!("Duplicate sync tag: {}", task.tag)));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(CoreError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.small_threshold > self.retry.medium_threshold {
            return Err(CoreError::Config(
                "retry.small_threshold must not exceed retry.medium_threshold".to_string(),
            ));
        }
        if self.scheduler.tick_secs == 0 || self.maintenance.interval_secs == 0 {
            return Err(CoreError::Config(
                "scheduler and maintenance intervals must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Versioned id of a configured bucket name
    pub fn bucket_id(&self, name: &str) -> String {
        bucket_id(name, &self.version)
    }

    /// Every versioned bucket id with its quota
    pub fn bucket_quotas(&self) -> Vec<(String, u64)> {
        self.buckets
            .iter()
            .map(|b| (self.bucket_id(&b.name), b.quota_bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ContentCategory;
    use crate::strategy::{MaxAge, StrategyKind};
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        config.validate().unwrap();

        assert_eq!(
            config.bucket_quotas(),
            vec![
                ("zim-packages-v1".to_string(), 500 * 1024 * 1024),
                ("static-assets-v1".to_string(), 100 * 1024 * 1024),
            ]
        );
        assert_eq!(config.sync[1].min_interval(), Duration::from_secs(900));
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(config.scheduler.tick_secs, 60);
        assert!(config.concurrency.max_fetches() >= 1);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(CacheConfig::from_toml_str("").unwrap(), CacheConfig::default());
    }

    #[test]
    fn test_eviction_policy_is_case_insensitive() {
        let config = CacheConfig::from_toml_str(r#"eviction_policy = "LFU""#).unwrap();
        assert_eq!(config.eviction_policy, EvictionPolicy::Lfu);

        let err = CacheConfig::from_toml_str(r#"eviction_policy = "random""#).unwrap_err();
        assert!(err.to_string().contains("Invalid eviction policy"));
    }

    #[test]
    fn test_partial_document() {
        let config = CacheConfig::from_toml_str(
            r#"
            version = "3"
            eviction_policy = "fifo"

            [[buckets]]
            name = "zim-packages"
            quota_bytes = 1000

            [[buckets]]
            name = "static-assets"
            quota_bytes = 200

            [strategies.json]
            strategy = "cacheFirst"
            max_entries = 7
            bucket = "static-assets"

            [[sync]]
            tag = "nightly"
            min_interval_secs = 86400
            resources = ["/index.json"]
            "#,
        )
        .unwrap();

        assert_eq!(config.bucket_id("zim-packages"), "zim-packages-v3");
        assert_eq!(config.eviction_policy, EvictionPolicy::Fifo);

        let json = config.strategies.resolve(ContentCategory::Json);
        assert_eq!(json.strategy, StrategyKind::CacheFirst);
        assert_eq!(json.max_age, MaxAge::Unlimited);
        // untouched categories keep their defaults
        assert_eq!(
            config.strategies.resolve(ContentCategory::Page).strategy,
            StrategyKind::NetworkFirst
        );
        assert_eq!(config.sync.len(), 1);
        assert_eq!(config.sync[0].resources, vec!["/index.json".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_bucket_in_strategy() {
        let err = CacheConfig::from_toml_str(
            r#"
            [strategies.zim]
            strategy = "cacheFirst"
            max_entries = 5
            bucket = "archives"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown bucket archives"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = CacheConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.buckets[0].quota_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.sync.push(config.sync[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::load(dir.path().join("stash.toml")).unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_load_and_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stash.toml");
        std::fs::write(&path, toml::to_string_pretty(&CacheConfig::default()).unwrap()).unwrap();

        assert_eq!(CacheConfig::load(&path).unwrap(), CacheConfig::default());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stash.toml");
        std::fs::write(&path, "buckets = 12").unwrap();

        let err = CacheConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
