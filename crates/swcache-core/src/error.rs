//! Error types for the offline cache.
//!
//! One enum per failure class. Storage and network failures are normally
//! recovered inside the strategy layer; only [`HandleError`] and
//! [`LifecycleError`] reach the host.

use std::time::Duration;

use thiserror::Error;

use crate::partition::PartitionId;
use crate::request::RequestKey;

/// Failures of a [`CacheStore`](crate::store::CacheStore) operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Quota exceeded in {partition}: {needed} bytes needed, {limit} allowed")]
    QuotaExceeded {
        partition: PartitionId,
        needed: usize,
        limit: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Failures of the network collaborator.
///
/// A timeout is kept distinct from other network errors even though the
/// strategies treat both the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Whether this failure is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout(_))
    }
}

/// Terminal failures of [`StrategyExecutor::handle`](crate::strategy::StrategyExecutor::handle).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// Neither the cache nor the network could produce a response.
    #[error("Not available offline: {key}")]
    NotAvailable { key: RequestKey },

    /// Network failure on a request that never touches the cache.
    #[error(transparent)]
    Network(#[from] FetchError),
}

/// Failures of a lifecycle transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Install manifest failed at {url}: {reason}")]
    InstallManifest { url: String, reason: String },

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: crate::lifecycle::LifecycleState,
    },

    #[error("Storage error during {action}: {source}")]
    Storage {
        action: &'static str,
        #[source]
        source: StoreError,
    },
}

impl LifecycleError {
    /// Whether the host may run the same transition again from scratch.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LifecycleError::InvalidTransition { .. })
    }
}

/// Failures loading or validating a [`WorkerConfig`](crate::config::WorkerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
