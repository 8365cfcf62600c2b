//! Persistent key-value storage over named partitions.
//!
//! ```text
//! CacheStore
//!     └── Partition (name@version, EvictionPolicy)
//!             └── RequestKey → CacheEntry
//! ```
//!
//! Implementations serialize writes to the same `(partition, key)`; the last
//! write wins.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::partition::PartitionId;
use crate::policy::EvictionPolicy;
use crate::request::RequestKey;
use crate::response::CacheEntry;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage backend for cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry. No side effects.
    async fn get(
        &self,
        partition: &PartitionId,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Store `entry` under `entry.partition` / `entry.key`, replacing any
    /// existing entry, then apply the partition's eviction policy.
    ///
    /// Writing into an unknown partition creates it with no limits.
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

    /// Remove an entry. Succeeds if the key is absent.
    async fn delete(&self, partition: &PartitionId, key: &RequestKey) -> Result<(), StoreError>;

    /// Keys stored in a partition (empty for unknown partitions).
    async fn list_keys(&self, partition: &PartitionId) -> Result<Vec<RequestKey>, StoreError>;

    /// Every partition the store knows about, sorted by name.
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, StoreError>;

    /// Register a partition and its policy. Updates the policy if the
    /// partition exists; entries are kept.
    async fn create_partition(
        &self,
        partition: &PartitionId,
        policy: EvictionPolicy,
    ) -> Result<(), StoreError>;

    /// Remove a partition and all its entries at once. Succeeds if absent.
    async fn delete_partition(&self, partition: &PartitionId) -> Result<(), StoreError>;

    /// Number of entries in a partition.
    async fn entry_count(&self, partition: &PartitionId) -> Result<usize, StoreError> {
        Ok(self.list_keys(partition).await?.len())
    }
}
