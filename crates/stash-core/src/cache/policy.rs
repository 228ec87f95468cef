//! Cache eviction policies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entry::CacheEntry;

/// Error type for parsing eviction policy
#[derive(Debug, Clone)]
pub struct ParseEvictionPolicyError(String);

impl fmt::Display for ParseEvictionPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid eviction policy: {}", self.0)
    }
}

impl std::error::Error for ParseEvictionPolicyError {}

/// Eviction policy for cache management
///
/// Every policy is a total order over entries, so the victim is always
/// deterministic. Remaining ties fall back to stored-at time and then key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum EvictionPolicy {
    /// Least Recently Used - evict items that haven't been accessed recently
    #[default]
    Lru,
    /// Least Frequently Used - evict items with the lowest access count
    Lfu,
    /// First In First Out - evict oldest items first
    Fifo,
}

impl EvictionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Fifo => "fifo",
        }
    }

    /// Pick the entry to evict next, or `None` if there are no entries
    pub fn next_victim<'a, I>(&self, entries: I) -> Option<&'a CacheEntry>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
    {
        match self {
            EvictionPolicy::Lru => entries
                .into_iter()
                .min_by(|a, b| (a.last_accessed_at, a.stored_at, &a.key).cmp(&(
                    b.last_accessed_at,
                    b.stored_at,
                    &b.key,
                ))),
            EvictionPolicy::Lfu => entries.into_iter().min_by(|a, b| {
                (a.access_count, a.last_accessed_at, a.stored_at, &a.key).cmp(&(
                    b.access_count,
                    b.last_accessed_at,
                    b.stored_at,
                    &b.key,
                ))
            }),
            EvictionPolicy::Fifo => entries
                .into_iter()
                .min_by(|a, b| (a.stored_at, &a.key).cmp(&(b.stored_at, &b.key))),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = ParseEvictionPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            _ => Err(ParseEvictionPolicyError(s.to_string())),
        }
    }
}

impl TryFrom<String> for EvictionPolicy {
    type Error = ParseEvictionPolicyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
