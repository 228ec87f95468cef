//! Caching strategies per content category

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::classifier::ContentCategory;

const DAY_SECS: u64 = 24 * 60 * 60;

pub const ZIM_BUCKET: &str = "zim-packages";
pub const STATIC_BUCKET: &str = "static-assets";

/// Error type for parsing a strategy kind
#[derive(Debug, Clone)]
pub struct ParseStrategyKindError(String);

impl fmt::Display for ParseStrategyKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid caching strategy: {}", self.0)
    }
}

impl std::error::Error for ParseStrategyKindError {}

/// How a request is resolved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", try_from = "String")]
pub enum StrategyKind {
    /// Serve the local copy when there is one; only go to the network on a miss
    CacheFirst,
    /// Prefer a fresh response; fall back to the local copy when the network fails
    NetworkFirst,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::CacheFirst => "cacheFirst",
            StrategyKind::NetworkFirst => "networkFirst",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ParseStrategyKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "cachefirst" => Ok(StrategyKind::CacheFirst),
            "networkfirst" => Ok(StrategyKind::NetworkFirst),
            _ => Err(ParseStrategyKindError(s.to_string())),
        }
    }
}

impl TryFrom<String> for StrategyKind {
    type Error = ParseStrategyKindError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Age policy of cached entries.
///
/// `Unlimited` only turns off age-based expiry. Such entries are still
/// evicted under quota pressure like any other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum MaxAge {
    Unlimited,
    Limited(Duration),
}

impl MaxAge {
    pub fn days(days: u64) -> Self {
        MaxAge::Limited(Duration::from_secs(days * DAY_SECS))
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, MaxAge::Unlimited)
    }
}

impl From<Option<u64>> for MaxAge {
    fn from(secs: Option<u64>) -> Self {
        match secs {
            Some(secs) => MaxAge::Limited(Duration::from_secs(secs)),
            None => MaxAge::Unlimited,
        }
    }
}

impl From<MaxAge> for Option<u64> {
    fn from(age: MaxAge) -> Self {
        match age {
            MaxAge::Unlimited => None,
            MaxAge::Limited(d) => Some(d.as_secs()),
        }
    }
}

/// Caching rule applied to every resource of one category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyRule {
    pub strategy: StrategyKind,
    pub max_entries: usize,
    /// Seconds; absent means unlimited
    #[serde(
        default = "unlimited",
        rename = "max_age_secs",
        skip_serializing_if = "MaxAge::is_unlimited"
    )]
    pub max_age: MaxAge,
    /// Bucket name, without the version suffix
    pub bucket: String,
}

fn unlimited() -> MaxAge {
    MaxAge::Unlimited
}

impl StrategyRule {
    pub fn new(strategy: StrategyKind, max_entries: usize, max_age: MaxAge, bucket: &str) -> Self {
        Self {
            strategy,
            max_entries,
            max_age,
            bucket: bucket.to_string(),
        }
    }
}

/// Strategy lookup table, one rule per category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyTable {
    #[serde(default = "default_zim_rule")]
    pub zim: StrategyRule,
    #[serde(default = "default_image_rule")]
    pub image: StrategyRule,
    #[serde(default = "default_json_rule")]
    pub json: StrategyRule,
    #[serde(default = "default_static_rule", rename = "static")]
    pub static_assets: StrategyRule,
    #[serde(default = "default_page_rule")]
    pub page: StrategyRule,
}

impl StrategyTable {
    /// Rule for a category
    pub fn resolve(&self, category: ContentCategory) -> &StrategyRule {
        match category {
            ContentCategory::Zim => &self.zim,
            ContentCategory::Image => &self.image,
            ContentCategory::Json => &self.json,
            ContentCategory::Static => &self.static_assets,
            ContentCategory::Page => &self.page,
        }
    }

    /// All rules paired with their category
    pub fn iter(&self) -> impl Iterator<Item = (ContentCategory, &StrategyRule)> {
        ContentCategory::ALL
            .into_iter()
            .map(move |category| (category, self.resolve(category)))
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            zim: default_zim_rule(),
            image: default_image_rule(),
            json: default_json_rule(),
            static_assets: default_static_rule(),
            page: default_page_rule(),
        }
    }
}

fn default_zim_rule() -> StrategyRule {
    StrategyRule::new(StrategyKind::CacheFirst, 5, MaxAge::Unlimited, ZIM_BUCKET)
}

fn default_image_rule() -> StrategyRule {
    StrategyRule::new(StrategyKind::CacheFirst, 100, MaxAge::days(7), STATIC_BUCKET)
}

fn default_json_rule() -> StrategyRule {
    StrategyRule::new(StrategyKind::NetworkFirst, 50, MaxAge::days(1), STATIC_BUCKET)
}

fn default_static_rule() -> StrategyRule {
    StrategyRule::new(StrategyKind::CacheFirst, 30, MaxAge::days(30), STATIC_BUCKET)
}

fn default_page_rule() -> StrategyRule {
    StrategyRule::new(StrategyKind::NetworkFirst, 20, MaxAge::days(1), STATIC_BUCKET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = StrategyTable::default();

        let zim = table.resolve(ContentCategory::Zim);
        assert_eq!(zim.strategy, StrategyKind::CacheFirst);
        assert_eq!(zim.max_entries, 5);
        assert!(zim.max_age.is_unlimited());
        assert_eq!(zim.bucket, ZIM_BUCKET);

        assert_eq!(
            table.resolve(ContentCategory::Json).strategy,
            StrategyKind::NetworkFirst
        );
        assert_eq!(
            table.resolve(ContentCategory::Page).strategy,
            StrategyKind::NetworkFirst
        );
        assert_eq!(
            table.resolve(ContentCategory::Static).max_age,
            MaxAge::days(30)
        );
        assert_eq!(table.iter().count(), 5);
    }

    #[test]
    fn test_strategy_spellings_in_config() {
        let rule: StrategyRule = toml::from_str(
            r#"
            strategy = "network-first"
            max_entries = 10
            bucket = "static-assets"
            "#,
        )
        .unwrap();
        assert_eq!(rule.strategy, StrategyKind::NetworkFirst);

        let rule: StrategyRule = toml::from_str(
            r#"
            strategy = "Cache_First"
            max_entries = 10
            bucket = "static-assets"
            "#,
        )
        .unwrap();
        assert_eq!(rule.strategy, StrategyKind::CacheFirst);

        let err = toml::from_str::<StrategyRule>(
            r#"
            strategy = "staleWhileRevalidate"
            max_entries = 10
            bucket = "static-assets"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid caching strategy"));
    }

    #[test]
    fn test_rule_from_toml() {
        let rule: StrategyRule = toml::from_str(
            r#"
            strategy = "networkFirst"
            max_entries = 10
            max_age_secs = 3600
            bucket = "static-assets"
            "#,
        )
        .unwrap();
        assert_eq!(rule.max_age, MaxAge::Limited(Duration::from_secs(3600)));

        let rule: StrategyRule = toml::from_str(
            r#"
            strategy = "cacheFirst"
            max_entries = 5
            bucket = "zim-packages"
            "#,
        )
        .unwrap();
        assert_eq!(rule.max_age, MaxAge::Unlimited);
    }
}
