//! # swcache Net
//!
//! The network side of the cache: an [`HttpFetcher`] that implements
//! [`swcache_core::Fetcher`] over `reqwest`.
//!
//! Every HTTP status is a successful fetch; deciding what to cache is up to
//! the strategy layer. Only transport failures become [`FetchError`]s, with
//! timeouts reported separately from other failures.

use std::time::Duration;

use async_trait::async_trait;
use http::HeaderValue;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};

use swcache_core::{CachedResponse, FetchError, Fetcher, RequestDescriptor};

/// Errors building the HTTP client.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header, sent unless the request sets its own.
    pub accept_language: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("swcache/", env!("CARGO_PKG_VERSION")).to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Network collaborator backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    /// Create a fetcher.
    pub fn new(config: FetcherConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        info!(timeout = ?config.timeout, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn map_error(&self, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(self.config.timeout)
        } else if error.is_builder() {
            FetchError::InvalidRequest(error.to_string())
        } else {
            FetchError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<CachedResponse, FetchError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut headers = request.headers.clone();
        if !headers.contains_key(http::header::ACCEPT_LANGUAGE) {
            if let Ok(value) = HeaderValue::from_str(&self.config.accept_language) {
                headers.insert(http::header::ACCEPT_LANGUAGE, value);
            }
        }

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers);

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        trace!(
            url = %request.url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(CachedResponse {
            status,
            headers,
            body,
        })
    }
}
