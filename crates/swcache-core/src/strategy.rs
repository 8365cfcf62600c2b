//! Cache strategies and their executor.
//!
//! | Strategy | Cache hit | Cache miss | Network down |
//! |---|---|---|---|
//! | `CacheFirst` | cached | fetch + store | cached, else `NotAvailable` |
//! | `NetworkFirst` | fetch + store | fetch + store | cached, else `NotAvailable` |
//! | `CacheFirstWithBackgroundUpdate` | cached + refresh | as `NetworkFirst` | cached, else `NotAvailable` |
//! | `NetworkOnly` | fetch | fetch | error |
//!
//! Requests other than GET and responses outside 2xx never touch the cache.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{FetchError, HandleError};
use crate::fetch::Fetcher;
use crate::partition::PartitionId;
use crate::refresher::BackgroundRefresher;
use crate::request::{KeyNormalizer, RequestDescriptor, RequestKey};
use crate::response::{CacheEntry, CachedResponse, FetchOutcome, ServedResponse};
use crate::store::CacheStore;

/// Default bound on the network attempt of `NetworkFirst`.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(3);

/// Read/write policy for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    CacheFirstWithBackgroundUpdate,
    NetworkOnly,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirstWithBackgroundUpdate => "cache-first-with-background-update",
            Strategy::NetworkOnly => "network-only",
        }
    }
}

/// Strategy plus the partition it reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyConfig {
    pub strategy: Strategy,
    pub partition: PartitionId,
    /// Only used by strategies that race the network against the cache.
    pub network_timeout: Duration,
}

impl StrategyConfig {
    pub fn new(strategy: Strategy, partition: PartitionId) -> Self {
        Self {
            strategy,
            partition,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, network_timeout: Duration) -> Self {
        self.network_timeout = network_timeout;
        self
    }
}

/// Serves requests from the cache, the network, or both.
///
/// Stateless apart from its collaborators; concurrent calls for different
/// keys do not interact.
#[derive(Clone)]
pub struct StrategyExecutor {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    refresher: BackgroundRefresher,
    normalizer: KeyNormalizer,
}

impl StrategyExecutor {
    pub fn new(store: Arc<dyn CacheStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            refresher: BackgroundRefresher::new(store.clone(), fetcher.clone()),
            store,
            fetcher,
            normalizer: KeyNormalizer::default(),
        }
    }

    /// Use a custom key normalizer.
    pub fn with_normalizer(mut self, normalizer: KeyNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn normalizer(&self) -> &KeyNormalizer {
        &self.normalizer
    }

    pub fn refresher(&self) -> &BackgroundRefresher {
        &self.refresher
    }

    /// Serve `request` according to `config`.
    ///
    /// Storage failures are logged and otherwise ignored. The only errors are
    /// `NotAvailable` (nothing cached and no network) and network failures of
    /// requests that bypass the cache.
    pub async fn handle(
        &self,
        request: &RequestDescriptor,
        config: &StrategyConfig,
    ) -> Result<ServedResponse, HandleError> {
        if !request.is_cacheable_read() {
            trace!(method = %request.method, url = %request.url, "Bypassing cache for write verb");
            return self.pass_through(request).await;
        }

        let key = self.normalizer.key(request);
        trace!(key = %key, partition = %config.partition, strategy = config.strategy.as_str(), "Handling request");

        match config.strategy {
            Strategy::CacheFirst => self.cache_first(request, key, config).await,
            Strategy::NetworkFirst => self.network_first(request, key, config).await,
            Strategy::CacheFirstWithBackgroundUpdate => {
                self.cache_first_with_update(request, key, config).await
            }
            Strategy::NetworkOnly => self.pass_through(request).await,
        }
    }

    /// Fetch from the network without reading or writing the cache.
    pub async fn pass_through(
        &self,
        request: &RequestDescriptor,
    ) -> Result<ServedResponse, HandleError> {
        let response = self.fetcher.fetch(request).await?;
        Ok(ServedResponse::from_network(response))
    }

    async fn cache_first(
        &self,
        request: &RequestDescriptor,
        key: RequestKey,
        config: &StrategyConfig,
    ) -> Result<ServedResponse, HandleError> {
        if let FetchOutcome::CacheHit(entry) = self.lookup(&config.partition, &key).await {
            return Ok(ServedResponse::from_cache(entry));
        }

        match self.fetch_network(request).await {
            FetchOutcome::NetworkOk(response) => {
                self.store_response(&config.partition, &key, &response).await;
                Ok(ServedResponse::from_network(response))
            }
            FetchOutcome::NetworkFailed(e) => {
                debug!(key = %key, error = %e, "Cache miss and network failed");
                Err(HandleError::NotAvailable { key })
            }
            FetchOutcome::CacheHit(_) | FetchOutcome::CacheMiss => {
                Err(HandleError::NotAvailable { key })
            }
        }
    }

    async fn network_first(
        &self,
        request: &RequestDescriptor,
        key: RequestKey,
        config: &StrategyConfig,
    ) -> Result<ServedResponse, HandleError> {
        // Only the fetch races the timeout. The task reports the outcome,
        // then writes the cache; a late success still lands.
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let this = self.clone();
        let partition = config.partition.clone();
        let task_key = key.clone();
        let task_request = request.clone();
        let writer = tokio::spawn(async move {
            let outcome = this.fetch_network(&task_request).await;
            let response = match &outcome {
                FetchOutcome::NetworkOk(response) => Some(response.clone()),
                _ => None,
            };
            let _ = outcome_tx.send(outcome);
            if let Some(response) = response {
                this.store_response(&partition, &task_key, &response).await;
            }
        });

        let failure = match tokio::time::timeout(config.network_timeout, outcome_rx).await {
            Ok(Ok(FetchOutcome::NetworkOk(response))) => {
                // Store, then return. The write is not bounded by the timeout.
                if let Err(e) = writer.await {
                    warn!(key = %key, error = %e, "Cache write task failed");
                }
                return Ok(ServedResponse::from_network(response));
            }
            Ok(Ok(FetchOutcome::NetworkFailed(e))) => e,
            Ok(Ok(_)) => FetchError::Network("unexpected fetch outcome".to_string()),
            Ok(Err(_)) => FetchError::Network("fetch task ended without a result".to_string()),
            Err(_) => FetchError::Timeout(config.network_timeout),
        };

        debug!(
            key = %key,
            error = %failure,
            timeout = failure.is_timeout(),
            "Network attempt failed, falling back to cache"
        );

        match self.lookup(&config.partition, &key).await {
            FetchOutcome::CacheHit(entry) => Ok(ServedResponse::from_cache(entry)),
            _ => Err(HandleError::NotAvailable { key }),
        }
    }

    async fn cache_first_with_update(
        &self,
        request: &RequestDescriptor,
        key: RequestKey,
        config: &StrategyConfig,
    ) -> Result<ServedResponse, HandleError> {
        match self.lookup(&config.partition, &key).await {
            FetchOutcome::CacheHit(entry) => {
                drop(self.refresher.refresh(
                    config.partition.clone(),
                    key,
                    request.clone(),
                ));
                Ok(ServedResponse::from_cache(entry))
            }
            // The network-first fetch doubles as the revalidation.
            _ => self.network_first(request, key, config).await,
        }
    }

    /// Read the cache; storage errors count as a miss.
    async fn lookup(&self, partition: &PartitionId, key: &RequestKey) -> FetchOutcome {
        match self.store.get(partition, key).await {
            Ok(Some(entry)) => {
                trace!(partition = %partition, key = %key, "Cache hit");
                FetchOutcome::CacheHit(entry)
            }
            Ok(None) => FetchOutcome::CacheMiss,
            Err(e) => {
                warn!(partition = %partition, key = %key, error = %e, "Cache read failed, treating as miss");
                FetchOutcome::CacheMiss
            }
        }
    }

    async fn fetch_network(&self, request: &RequestDescriptor) -> FetchOutcome {
        match self.fetcher.fetch(request).await {
            Ok(response) => FetchOutcome::NetworkOk(response),
            Err(e) => FetchOutcome::NetworkFailed(e),
        }
    }

    /// Store a 2xx response. A failed write is logged and dropped.
    async fn store_response(
        &self,
        partition: &PartitionId,
        key: &RequestKey,
        response: &CachedResponse,
    ) {
        if !response.is_success() {
            debug!(key = %key, status = response.status.as_u16(), "Not caching non-success response");
            return;
        }

        let entry = CacheEntry::new(partition.clone(), key.clone(), response.clone());
        if let Err(e) = self.store.put(entry).await {
            warn!(partition = %partition, key = %key, error = %e, "Failed to store response");
        }
    }
}
