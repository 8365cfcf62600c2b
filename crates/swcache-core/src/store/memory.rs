//! In-process store. Not durable; used for tests and ephemeral hosts.

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::CacheStore;
use crate::error::StoreError;
use crate::partition::PartitionId;
use crate::policy::{EntryStamp, EvictionPolicy};
use crate::request::RequestKey;
use crate::response::CacheEntry;

#[derive(Debug, Default)]
struct MemoryPartition {
    policy: EvictionPolicy,
    entries: HashMap<RequestKey, (CacheEntry, u64)>,
    next_seq: u64,
}

impl MemoryPartition {
    fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    fn bytes(&self) -> usize {
        self.entries.values().map(|(e, _)| e.response.size()).sum()
    }

    fn evict(&mut self, partition: &PartitionId) {
        let stamps: Vec<EntryStamp> = self
            .entries
            .iter()
            .map(|(key, (entry, seq))| EntryStamp {
                key: key.clone(),
                stored_at: entry.stored_at,
                seq: *seq,
            })
            .collect();

        for victim in self.policy.victims(&stamps, Utc::now()) {
            debug!(partition = %partition, key = %victim, "Evicting entry");
            self.entries.remove(&victim);
        }
    }
}

/// Cache store held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<PartitionId, MemoryPartition>>,
    /// Total byte budget across all partitions.
    quota: Option<usize>,
}

impl MemoryStore {
    /// Create an empty store with no quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that rejects writes beyond `bytes` in total.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota: Some(bytes),
            ..Default::default()
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(
        &self,
        partition: &PartitionId,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .and_then(|p| p.entries.get(key))
            .map(|(entry, _)| entry.clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;

        if let Some(limit) = self.quota {
            let used: usize = partitions.values().map(MemoryPartition::bytes).sum();
            let replaced = partitions
                .get(&entry.partition)
                .and_then(|p| p.entries.get(&entry.key))
                .map(|(e, _)| e.response.size())
                .unwrap_or(0);
            let needed = used - replaced + entry.response.size();
            if needed > limit {
                return Err(StoreError::QuotaExceeded {
                    partition: entry.partition.clone(),
                    needed,
                    limit,
                });
            }
        }

        let partition_id = entry.partition.clone();
        let partition = partitions
            .entry(partition_id.clone())
            .or_insert_with(|| MemoryPartition::new(EvictionPolicy::unbounded()));

        partition.next_seq += 1;
        let seq = partition.next_seq;
        trace!(partition = %partition_id, key = %entry.key, seq, "Storing entry");
        partition.entries.insert(entry.key.clone(), (entry, seq));
        partition.evict(&partition_id);

        Ok(())
    }

    async fn delete(&self, partition: &PartitionId, key: &RequestKey) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        if let Some(p) = partitions.get_mut(partition) {
            p.entries.remove(key);
        }
        Ok(())
    }

    async fn list_keys(&self, partition: &PartitionId) -> Result<Vec<RequestKey>, StoreError> {
        let partitions = self.partitions.read().await;
        let mut keys: Vec<RequestKey> = partitions
            .get(partition)
            .map(|p| p.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionId>, StoreError> {
        let partitions = self.partitions.read().await;
        let mut ids: Vec<PartitionId> = partitions.keys().cloned().collect();
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }

    async fn create_partition(
        &self,
        partition: &PartitionId,
        policy: EvictionPolicy,
    ) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(partition.clone())
            .and_modify(|p| p.policy = policy)
            .or_insert_with(|| MemoryPartition::new(policy));
        Ok(())
    }

    async fn delete_partition(&self, partition: &PartitionId) -> Result<(), StoreError> {
        self.partitions.write().await.remove(partition);
        Ok(())
    }

    async fn entry_count(&self, partition: &PartitionId) -> Result<usize, StoreError> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(partition).map_or(0, |p| p.entries.len()))
    }
}
