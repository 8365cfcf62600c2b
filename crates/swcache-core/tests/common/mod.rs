//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use swcache_core::{CachedResponse, FetchError, Fetcher, RequestDescriptor};

/// Serves a fixed body, can be switched offline, and fails listed paths.
pub struct StubNetwork {
    body: &'static str,
    offline: AtomicBool,
    broken_paths: Vec<&'static str>,
    calls: AtomicUsize,
}

impl StubNetwork {
    pub fn serving(body: &'static str) -> Self {
        Self {
            body,
            offline: AtomicBool::new(false),
            broken_paths: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn broken_for(mut self, path: &'static str) -> Self {
        self.broken_paths.push(path);
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubNetwork {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<CachedResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network("network unreachable".to_string()));
        }
        if self.broken_paths.contains(&request.url.path()) {
            return Err(FetchError::Network(format!("connection reset: {}", request.url)));
        }
        Ok(CachedResponse::ok(self.body))
    }
}
