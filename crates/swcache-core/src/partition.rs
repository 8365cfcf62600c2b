//! Partitions and the purpose → partition mapping.
//!
//! A partition is named `<purpose>@<version>`. The version comes from one
//! place, the [`PartitionManager`], so every purpose moves to a new partition
//! together when the version changes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::policy::EvictionPolicy;
use crate::store::CacheStore;

/// Logical purpose of a partition ("api", "static", "fonts", "images", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Purpose(String);

impl Purpose {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Purpose {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Version-qualified partition name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionId {
    purpose: Purpose,
    version: String,
}

impl PartitionId {
    pub fn new(purpose: impl Into<Purpose>, version: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            version: version.into(),
        }
    }

    pub fn purpose(&self) -> &Purpose {
        &self.purpose
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.purpose)
        } else {
            write!(f, "{}@{}", self.purpose, self.version)
        }
    }
}

impl FromStr for PartitionId {
    type Err = String;

    /// Names without `@` (e.g. left behind by older builds) parse with an
    /// empty version so they can still be listed and collected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty partition name".to_string());
        }
        match s.rsplit_once('@') {
            Some((purpose, version)) if !purpose.is_empty() => {
                Ok(PartitionId::new(purpose, version))
            }
            _ => Ok(PartitionId::new(s, "")),
        }
    }
}

impl TryFrom<String> for PartitionId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PartitionId> for String {
    fn from(id: PartitionId) -> Self {
        id.to_string()
    }
}

/// Outcome of [`PartitionManager::garbage_collect`].
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub deleted: Vec<PartitionId>,
    pub failed: Vec<(PartitionId, StoreError)>,
}

impl GcReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Maps purposes to the current versioned partition.
pub struct PartitionManager {
    version: String,
    store: Arc<dyn CacheStore>,
    policies: HashMap<Purpose, EvictionPolicy>,
    current: HashMap<Purpose, PartitionId>,
}

impl PartitionManager {
    /// Create a manager for `version` over `store`.
    pub fn new(version: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        Self {
            version: version.into(),
            store,
            policies: HashMap::new(),
            current: HashMap::new(),
        }
    }

    /// The version tag every current partition carries.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Current partition name for `purpose`. Deterministic; does not touch the store.
    pub fn resolve_partition(&self, purpose: &Purpose) -> PartitionId {
        PartitionId::new(purpose.clone(), self.version.clone())
    }

    /// Create the current partition for `purpose` if absent and register its policy.
    pub async fn ensure_current(
        &mut self,
        purpose: &Purpose,
        policy: EvictionPolicy,
    ) -> Result<PartitionId, StoreError> {
        let id = self.resolve_partition(purpose);
        self.store.create_partition(&id, policy).await?;

        debug!(partition = %id, ?policy, "Partition ensured");

        self.policies.insert(purpose.clone(), policy);
        self.current.insert(purpose.clone(), id.clone());
        Ok(id)
    }

    /// Purposes that have a current partition, with their ids.
    pub fn current(&self) -> &HashMap<Purpose, PartitionId> {
        &self.current
    }

    /// Policy registered for `purpose`, if any.
    pub fn policy_for(&self, purpose: &Purpose) -> Option<EvictionPolicy> {
        self.policies.get(purpose).copied()
    }

    /// Whether `id` is the current partition of its purpose.
    pub fn is_current(&self, id: &PartitionId) -> bool {
        self.current.get(id.purpose()) == Some(id)
    }

    /// Forget every current partition, e.g. after a failed install.
    pub fn reset(&mut self) {
        self.current.clear();
        self.policies.clear();
    }

    /// Delete every partition whose id is not a value of `keep`.
    ///
    /// Best effort: a failed deletion is recorded in the report and the
    /// remaining partitions are still processed.
    pub async fn garbage_collect(
        &self,
        keep: &HashMap<Purpose, PartitionId>,
    ) -> Result<GcReport, StoreError> {
        let mut report = GcReport::default();

        for id in self.store.list_partitions().await? {
            if keep.values().any(|kept| kept == &id) {
                continue;
            }

            match self.store.delete_partition(&id).await {
                Ok(()) => {
                    info!(partition = %id, "Deleted stale partition");
                    report.deleted.push(id);
                }
                Err(e) => {
                    warn!(partition = %id, error = %e, "Failed to delete stale partition");
                    report.failed.push((id, e));
                }
            }
        }

        Ok(report)
    }
}
