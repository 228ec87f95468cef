//! Fetcher trait and request/response types

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CACHE_CONTROL;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::time::Duration;

use crate::error::FetchError;

/// A request for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Path or absolute URL of the resource
    pub identifier: String,
    pub method: Method,
}

/// A complete response from the network
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Add a header, ignoring values that aren't valid header text
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Whether any `cache-control` header carries a `no-store` directive
    pub fn is_no_store(&self) -> bool {
        self.headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
    }
}

/// Transport used by the cache for every network attempt
///
/// Implementations perform exactly one attempt per call; retrying is the
/// caller's job. An attempt that doesn't finish within `timeout` must fail
/// with [`FetchError::Timeout`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchError>;
}
