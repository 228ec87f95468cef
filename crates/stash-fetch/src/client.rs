//! HTTP fetcher

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::FetchError;
use crate::fetcher::{FetchRequest, FetchResponse, Fetcher};

/// HTTP fetcher configuration
#[derive(Clone, Debug, Default)]
pub struct HttpFetcherConfig {
    /// Origin that relative identifiers are resolved against
    pub base_url: Option<String>,
    /// Skip TLS certificate verification
    pub skip_tls_verify: bool,
    /// Override the default `User-Agent`
    pub user_agent: Option<String>,
}

/// [`Fetcher`] backed by a reqwest client
pub struct HttpFetcher {
    base_url: Option<Url>,
    client: Client,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let base_url = config
            .base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| FetchError::InvalidRequest(format!("Invalid base URL: {}", e)))?;

        let mut builder = Client::builder();

        if config.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        match &base_url {
            Some(url) => info!("Created HTTP fetcher for {}", url),
            None => info!("Created HTTP fetcher without a base URL"),
        }

        Ok(Self { base_url, client })
    }

    /// Resolve an identifier to an absolute URL
    fn resolve(&self, identifier: &str) -> Result<Url, FetchError> {
        if let Ok(url) = Url::parse(identifier) {
            return Ok(url);
        }

        let base = self.base_url.as_ref().ok_or_else(|| {
            FetchError::InvalidRequest(format!(
                "Relative identifier without a base URL: {}",
                identifier
            ))
        })?;

        base.join(identifier)
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", identifier, e)))
    }

    fn map_error(error: reqwest::Error, timeout: Duration) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(timeout)
        } else if error.is_builder() {
            FetchError::InvalidRequest(error.to_string())
        } else {
            FetchError::Connection(error.to_string())
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchError> {
        let url = self.resolve(&request.identifier)?;

        debug!("Fetching {} {} (timeout {:?})", request.method, url, timeout);

        let response = self
            .client
            .request(request.method.clone(), url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_error(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(e, timeout))?;

        debug!("Fetched {} ({} bytes)", status, body.len());

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}
