//! Request dispatch
//!
//! Resolves one resource request end to end: classify it, look up its
//! strategy rule, then run cache-first or network-first against the cache
//! store, reserving quota before every insert and retrying every network
//! attempt. Concurrent requests for the same key share a single fetch.

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use stash_fetch::{FetchError, FetchRequest, FetchResponse, Fetcher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, CachedResponse, EntryMeta, QuotaManager, cache_key};
use crate::classifier::{ContentCategory, classify};
use crate::config::CacheConfig;
use crate::error::CoreError;
use crate::retry::RetryController;
use crate::strategy::StrategyKind;

type SharedFetch = Shared<BoxFuture<'static, Result<FetchResponse, FetchError>>>;

/// A request for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Path or absolute URL
    pub identifier: String,
    /// Size the caller expects, used to pick the attempt timeout
    pub declared_length: Option<u64>,
    pub method: Method,
}

impl ResourceRequest {
    pub fn new(method: Method, identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            declared_length: None,
            method,
        }
    }

    pub fn get(identifier: impl Into<String>) -> Self {
        Self::new(Method::GET, identifier)
    }

    pub fn with_declared_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }

    fn is_read_only(&self) -> bool {
        self.method == Method::GET
    }

    fn to_fetch_request(&self) -> FetchRequest {
        FetchRequest {
            identifier: self.identifier.clone(),
            method: self.method.clone(),
        }
    }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct ResourceResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl From<FetchResponse> for ResourceResponse {
    fn from(response: FetchResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            source: ResponseSource::Network,
        }
    }
}

impl From<CachedResponse> for ResourceResponse {
    fn from(cached: CachedResponse) -> Self {
        Self {
            status: cached.entry.status_code(),
            headers: cached.entry.header_map(),
            body: cached.body,
            source: ResponseSource::Cache,
        }
    }
}

/// Successful outcome of a dispatch
#[derive(Debug, Clone)]
pub enum Resolution {
    /// From the network, or a cache-first hit
    Fresh(ResourceResponse),
    /// Served from the cache after the network failed; may be out of date
    Stale(ResourceResponse),
}

impl Resolution {
    pub fn response(&self) -> &ResourceResponse {
        match self {
            Resolution::Fresh(response) | Resolution::Stale(response) => response,
        }
    }

    pub fn into_response(self) -> ResourceResponse {
        match self {
            Resolution::Fresh(response) | Resolution::Stale(response) => response,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Resolution::Stale(_))
    }
}

/// Whether a network response may be written to the cache: only `GET`
/// requests answered with `200` and without a `no-store` directive.
pub fn should_cache(request: &ResourceRequest, response: &FetchResponse) -> bool {
    request.is_read_only() && response.status == StatusCode::OK && !response.is_no_store()
}

/// Executes caching strategies for resource requests
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: Arc<CacheConfig>,
    store: Arc<CacheStore>,
    quota: Arc<QuotaManager>,
    retry: RetryController,
    fetcher: Arc<dyn Fetcher>,
    permits: Semaphore,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<CacheConfig>,
        store: Arc<CacheStore>,
        quota: Arc<QuotaManager>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let max_fetches = config.concurrency.max_fetches().max(1);
        info!("Dispatcher initialized ({} concurrent fetches)", max_fetches);

        Self {
            inner: Arc::new(DispatcherInner {
                retry: RetryController::new(config.retry.clone()),
                permits: Semaphore::new(max_fetches),
                in_flight: Mutex::new(HashMap::new()),
                config,
                store,
                quota,
                fetcher,
            }),
        }
    }

    /// Resolve a request with the strategy of its category.
    ///
    /// Only a network failure with no cached copy to fall back on is an
    /// error. Storage faults and quota rejections are logged and absorbed.
    pub async fn dispatch(&self, request: &ResourceRequest) -> Result<Resolution, CoreError> {
        let started = tokio::time::Instant::now();
        let category = classify(&request.identifier);
        let strategy = self.inner.config.strategies.resolve(category).strategy;

        debug!(
            "Dispatching {} {} as {} ({})",
            request.method,
            request.identifier,
            category,
            strategy.as_str()
        );

        let result = if !request.is_read_only() {
            // Never looked up, stored, or shared with other requests
            self.inner
                .fetch(request)
                .await
                .map(|response| Resolution::Fresh(response.into()))
                .map_err(CoreError::from)
        } else {
            match strategy {
                StrategyKind::CacheFirst => self.cache_first(request, category).await,
                StrategyKind::NetworkFirst => self.network_first(request, category).await,
            }
        };

        metrics::histogram!(
            "stash_response_seconds",
            "category" => category.as_str(),
            "strategy" => strategy.as_str()
        )
        .record(started.elapsed().as_secs_f64());

        result
    }

    /// Fetch a resource from the network and store it under the usual
    /// rules, regardless of its strategy. Never falls back to the cache.
    pub async fn refresh(&self, identifier: &str) -> Result<ResourceResponse, CoreError> {
        let request = ResourceRequest::get(identifier);
        let category = classify(identifier);
        debug!("Refreshing {} ({})", identifier, category);

        let response = self.fetch_coalesced(&request, category).await?;
        Ok(response.into())
    }

    async fn cache_first(
        &self,
        request: &ResourceRequest,
        category: ContentCategory,
    ) -> Result<Resolution, CoreError> {
        if let Some(hit) = self.lookup(request, category).await {
            debug!("Cache hit for {}", request.identifier);
            metrics::counter!("stash_cache_hits_total", "category" => category.as_str())
                .increment(1);
            return Ok(Resolution::Fresh(hit.into()));
        }

        debug!("Cache miss for {}, fetching", request.identifier);
        metrics::counter!("stash_cache_misses_total", "category" => category.as_str())
            .increment(1);

        let response = self.fetch_coalesced(request, category).await?;
        Ok(Resolution::Fresh(response.into()))
    }

    async fn network_first(
        &self,
        request: &ResourceRequest,
        category: ContentCategory,
    ) -> Result<Resolution, CoreError> {
        let error = match self.fetch_coalesced(request, category).await {
            Ok(response) => return Ok(Resolution::Fresh(response.into())),
            Err(e) => e,
        };

        match self.lookup(request, category).await {
            Some(hit) => {
                warn!(
                    "Network failed for {} ({}), serving cached copy",
                    request.identifier, error
                );
                metrics::counter!("stash_stale_responses_total", "category" => category.as_str())
                    .increment(1);
                Ok(Resolution::Stale(hit.into()))
            }
            None => {
                warn!(
                    "Network failed for {} ({}) and nothing is cached",
                    request.identifier, error
                );
                Err(error.into())
            }
        }
    }

    /// Cache lookup that treats storage faults as misses.
    ///
    /// Entries past their max age are still served; only maintenance
    /// removes them, so an old copy stays available while offline.
    async fn lookup(
        &self,
        request: &ResourceRequest,
        category: ContentCategory,
    ) -> Option<CachedResponse> {
        let bucket = self.inner.bucket_for(category);
        let key = cache_key(&request.identifier);

        match self.inner.store.get(&bucket, &key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(
                    "Cache read failed for {}, treating as a miss: {}",
                    request.identifier, e
                );
                None
            }
        }
    }

    /// Fetch through the shared in-flight job for this key, starting one if
    /// none is running. The job stores the response before completing.
    async fn fetch_coalesced(
        &self,
        request: &ResourceRequest,
        category: ContentCategory,
    ) -> Result<FetchResponse, FetchError> {
        let key = cache_key(&request.identifier);

        let job = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(job) => {
                    debug!("Joining in-flight fetch of {}", request.identifier);
                    job.clone()
                }
                None => {
                    let job = self.inner.start_fetch(key.clone(), request.clone(), category);
                    in_flight.insert(key, job.clone());
                    job
                }
            }
        };

        job.await
    }
}

impl DispatcherInner {
    fn bucket_for(&self, category: ContentCategory) -> String {
        self.config
            .bucket_id(&self.config.strategies.resolve(category).bucket)
    }

    /// Spawn the fetch-and-store job for `key`.
    ///
    /// Runs on its own task, so it completes and clears its in-flight slot
    /// even when every requester has gone away.
    fn start_fetch(
        self: &Arc<Self>,
        key: String,
        request: ResourceRequest,
        category: ContentCategory,
    ) -> SharedFetch {
        let inner = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let result = inner.fetch_and_store(&request, category).await;
            inner.in_flight.lock().remove(&key);
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(FetchError::Connection(format!("fetch task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    async fn fetch_and_store(
        &self,
        request: &ResourceRequest,
        category: ContentCategory,
    ) -> Result<FetchResponse, FetchError> {
        let response = self.fetch(request).await?;

        if should_cache(request, &response) {
            self.persist(request, category, &response).await;
        } else {
            debug!(
                "Not caching {} (status {})",
                request.identifier, response.status
            );
        }

        Ok(response)
    }

    /// One logical fetch: attempts with timeouts and backoff, bounded by the
    /// fetch permits
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchResponse, FetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Connection("fetch pool closed".to_string()))?;

        let timeout = self.retry.timeout_for(request.declared_length);
        let fetch_request = request.to_fetch_request();

        self.retry
            .run(timeout, |attempt| {
                debug!(
                    "Fetching {} (attempt {}, timeout {:?})",
                    request.identifier,
                    attempt + 1,
                    timeout
                );
                self.fetcher.fetch(&fetch_request, timeout)
            })
            .await
    }

    /// Store a response, then trim its category. Failures only cost the
    /// cached copy.
    async fn persist(
        &self,
        request: &ResourceRequest,
        category: ContentCategory,
        response: &FetchResponse,
    ) {
        let rule = self.config.strategies.resolve(category);
        let bucket = self.config.bucket_id(&rule.bucket);
        let size = response.body.len() as u64;

        let reservation = match self.quota.reserve(&bucket, size).await {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!("Not caching {}: {}", request.identifier, e);
                return;
            }
        };

        let meta = EntryMeta {
            identifier: request.identifier.clone(),
            category,
            status: response.status,
            headers: response.headers.clone(),
            max_age: rule.max_age,
        };

        let key = cache_key(&request.identifier);
        if let Err(e) = self
            .store
            .put(reservation, &key, response.body.clone(), meta)
            .await
        {
            warn!("Failed to cache {}: {}", request.identifier, e);
            return;
        }

        if let Err(e) = self.quota.enforce_entry_limit(category).await {
            warn!("Failed to trim {} entries: {}", category, e);
        }
    }
}
