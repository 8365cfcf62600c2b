//! Fire-and-forget revalidation of cached entries.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::partition::PartitionId;
use crate::request::{RequestDescriptor, RequestKey};
use crate::response::CacheEntry;
use crate::store::CacheStore;

/// One entry to revalidate.
pub type RefreshTarget = (PartitionId, RequestKey, RequestDescriptor);

/// Result of [`BackgroundRefresher::refresh_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub refreshed: usize,
    pub failed: usize,
}

/// Refetches entries off the request path and writes fresh copies back.
#[derive(Clone)]
pub struct BackgroundRefresher {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl BackgroundRefresher {
    pub fn new(store: Arc<dyn CacheStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Revalidate one entry in a detached task.
    ///
    /// Callers normally drop the handle; it exists so tests and shutdown
    /// paths can wait for completion.
    pub fn refresh(
        &self,
        partition: PartitionId,
        key: RequestKey,
        request: RequestDescriptor,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.revalidate(partition, key, request).await;
        })
    }

    /// Revalidate many entries concurrently in one detached task.
    pub fn refresh_batch(&self, targets: Vec<RefreshTarget>) -> JoinHandle<BatchReport> {
        let this = self.clone();
        tokio::spawn(async move {
            let results = join_all(
                targets
                    .into_iter()
                    .map(|(partition, key, request)| this.revalidate(partition, key, request)),
            )
            .await;

            let refreshed = results.iter().filter(|ok| **ok).count();
            let report = BatchReport {
                refreshed,
                failed: results.len() - refreshed,
            };
            debug!(refreshed = report.refreshed, failed = report.failed, "Batch refresh done");
            report
        })
    }

    /// Fetch and store. Returns whether a fresh copy was written.
    async fn revalidate(
        &self,
        partition: PartitionId,
        key: RequestKey,
        request: RequestDescriptor,
    ) -> bool {
        let response = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(partition = %partition, key = %key, error = %e, "Revalidation fetch failed");
                return false;
            }
        };

        if !response.is_success() {
            debug!(
                partition = %partition,
                key = %key,
                status = response.status.as_u16(),
                "Revalidation returned non-success status"
            );
            return false;
        }

        match self.store.put(CacheEntry::new(partition.clone(), key.clone(), response)).await {
            Ok(()) => {
                debug!(partition = %partition, key = %key, "Entry revalidated");
                true
            }
            Err(e) => {
                warn!(partition = %partition, key = %key, error = %e, "Failed to store revalidated entry");
                false
            }
        }
    }
}
