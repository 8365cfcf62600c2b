//! Test doubles for the store and network seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

use crate::error::{FetchError, StoreError};
use crate::fetch::Fetcher;
use crate::partition::PartitionId;
use crate::policy::EvictionPolicy;
use crate::request::{RequestDescriptor, RequestKey};
use crate::response::{CacheEntry, CachedResponse};
use crate::store::{CacheStore, MemoryStore};

/// Fetcher that answers every request with a scripted result.
pub struct ScriptedFetcher {
    script: Mutex<Result<CachedResponse, FetchError>>,
    failing_paths: Vec<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(script: Result<CachedResponse, FetchError>) -> Self {
        Self {
            script: Mutex::new(script),
            failing_paths: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(Ok(CachedResponse::ok(body)))
    }

    pub fn status(status: StatusCode) -> Self {
        Self::new(Ok(CachedResponse::new(status, "")))
    }

    pub fn offline() -> Self {
        Self::new(Err(FetchError::Network("connection refused".to_string())))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail requests for `path` with a network error.
    pub fn failing_for(mut self, path: &str) -> Self {
        self.failing_paths.push(path.to_string());
        self
    }

    pub fn respond_with(&self, response: CachedResponse) {
        *self.script.lock().unwrap() = Ok(response);
    }

    pub fn go_offline(&self) {
        *self.script.lock().unwrap() = Err(FetchError::Network("connection refused".to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<CachedResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_paths.iter().any(|p| p == request.url.path()) {
            return Err(FetchError::Network(format!("unreachable: {}", request.url)));
        }
        let result = self.script.lock().unwrap().clone();
        result
    }
}

/// Memory store that counts entry reads/writes and fails on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_delete: Mutex<Option<PartitionId>>,
    write_delay: Option<Duration>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` take `delay` before it lands.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, partition: PartitionId) {
        *self.fail_delete.lock().unwrap() = Some(partition);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(
        &self,
        partition: &PartitionId,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk I/O error".to_string()));
        }
        self.inner.get(partition, key).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::QuotaExceeded {
                partition: entry.partition,
                needed: entry.response.size(),
                limit: 0,
            });
        }
        self.inner.put(entry).await
    }

    async fn delete(&self, partition: &PartitionId, key: &RequestKey) -> Result<(), StoreError> {
        self.inner.delete(partition, key).await
    }

    async fn list_keys(&self, partition: &PartitionId) -> Result<Vec<RequestKey>, StoreError> {
        self.inner.list_keys(partition).await
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionId>, StoreError> {
        self.inner.list_partitions().await
    }

    async fn create_partition(
        &self,
        partition: &PartitionId,
        policy: EvictionPolicy,
    ) -> Result<(), StoreError> {
        self.inner.create_partition(partition, policy).await
    }

    async fn delete_partition(&self, partition: &PartitionId) -> Result<(), StoreError> {
        let failing = self.fail_delete.lock().unwrap().clone();
        if failing.as_ref() == Some(partition) {
            return Err(StoreError::Backend("partition locked".to_string()));
        }
        self.inner.delete_partition(partition).await
    }
}
