//! Responses, cache entries and fetch outcomes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::error::FetchError;
use crate::partition::PartitionId;
use crate::request::RequestKey;

/// Response bytes plus status and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Create a response with no headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// A 200 response.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// Add a header, skipping invalid values.
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(name, v);
        }
        self
    }

    /// Whether the status is in the 2xx class.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        self.body.len() + headers
    }

    /// Headers as owned string pairs, skipping non-UTF-8 values.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
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

/// A stored response. Replaced wholesale on update, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub response: CachedResponse,
    pub stored_at: DateTime<Utc>,
    pub partition: PartitionId,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(partition: PartitionId, key: RequestKey, response: CachedResponse) -> Self {
        Self {
            key,
            response,
            stored_at: Utc::now(),
            partition,
        }
    }

    /// Override the storage timestamp.
    pub fn stored_at(mut self, stored_at: DateTime<Utc>) -> Self {
        self.stored_at = stored_at;
        self
    }
}

/// Result of a single cache lookup or network attempt.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    NetworkOk(CachedResponse),
    NetworkFailed(FetchError),
    CacheHit(CacheEntry),
    CacheMiss,
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Network => "network",
        }
    }
}

/// Response returned to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedResponse {
    pub response: CachedResponse,
    pub source: ResponseSource,
}

impl ServedResponse {
    pub fn from_cache(entry: CacheEntry) -> Self {
        Self {
            response: entry.response,
            source: ResponseSource::Cache,
        }
    }

    pub fn from_network(response: CachedResponse) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}
