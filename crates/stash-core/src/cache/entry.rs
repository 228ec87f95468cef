//! Cache entry types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::classifier::ContentCategory;
use crate::strategy::MaxAge;

/// Derive the storage key of a resource: hex SHA-256 of the identifier
/// with any fragment removed.
pub fn cache_key(identifier: &str) -> String {
    let without_fragment = identifier.split('#').next().unwrap_or_default();
    stash_storage::backend::compute_key(without_fragment.as_bytes())
}

/// Versioned bucket id, e.g. `zim-packages-v1`
pub fn bucket_id(name: &str, version: &str) -> String {
    format!("{}-v{}", name, version)
}

/// Metadata of one cached resource.
///
/// Serialized as JSON next to the payload so the index can be rebuilt after
/// a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub bucket: String,
    pub identifier: String,
    pub category: ContentCategory,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    /// Age policy of the rule this entry was written under
    pub max_age: MaxAge,
}

impl CacheEntry {
    /// Whether the entry outlived its age policy. Unlimited entries never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.max_age {
            MaxAge::Unlimited => false,
            MaxAge::Limited(max_age) => match chrono::Duration::from_std(max_age) {
                Ok(max_age) => self.stored_at + max_age < now,
                Err(_) => false,
            },
        }
    }

    /// Stored headers as a header map, skipping anything malformed
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }
}

/// What the caller knows about a resource when storing it
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub identifier: String,
    pub category: ContentCategory,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub max_age: MaxAge,
}

impl EntryMeta {
    pub(crate) fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }
}

/// A cache hit: the payload and its entry
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub entry: CacheEntry,
    pub body: Bytes,
}
