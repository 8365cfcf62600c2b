//! Request descriptors and cache keys.

use std::fmt;

use bytes::Bytes;
use hashbrown::HashSet;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameters dropped from keys unless configured otherwise.
pub const DEFAULT_VOLATILE_PARAMS: &[&str] = &["_", "_t", "_ts", "cachebust", "timestamp"];

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Subresource or API call.
    #[default]
    Subresource,
}

/// A request as seen by the cache layer.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl RequestDescriptor {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::Subresource,
        }
    }

    /// Create a navigation GET request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            ..Self::get(url)
        }
    }

    /// Parse `url` and build a GET request.
    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::get(Url::parse(url)?))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether this is a read that may be served from or stored in the cache.
    ///
    /// Only GET qualifies; every other verb resolves as network-only.
    pub fn is_cacheable_read(&self) -> bool {
        self.method == Method::GET
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Normalized identity of a request within a partition.
///
/// Rendered as `"<METHOD> <url>"` with the fragment and volatile query
/// parameters removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Wrap an already-normalized key string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives [`RequestKey`]s from requests.
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    volatile_params: HashSet<String>,
}

impl Default for KeyNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_PARAMS.iter().copied())
    }
}

impl KeyNormalizer {
    /// Create a normalizer that drops the given query parameter names.
    pub fn new<I, S>(volatile_params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            volatile_params: volatile_params.into_iter().map(Into::into).collect(),
        }
    }

    /// Key for a request.
    pub fn key(&self, request: &RequestDescriptor) -> RequestKey {
        self.key_for(&request.method, &request.url)
    }

    /// Key for a method and URL.
    pub fn key_for(&self, method: &Method, url: &Url) -> RequestKey {
        let mut url = url.clone();
        url.set_fragment(None);

        if url.query().is_some() {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(name, _)| !self.volatile_params.contains(name.as_ref()))
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();

            if kept.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(kept);
            }
        }

        RequestKey(format!("{} {}", method.as_str(), url))
    }
}
