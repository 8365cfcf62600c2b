//! Network collaborator seam.

use async_trait::async_trait;

use crate::error::FetchError;
use crate::request::RequestDescriptor;
use crate::response::CachedResponse;

/// Performs network requests on behalf of the cache.
///
/// Any status, including 4xx/5xx, is a successful fetch; only transport
/// failures are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<CachedResponse, FetchError>;
}
