//! Per-partition eviction policy.
//!
//! Policies are applied lazily by the store after each write; there is no
//! background sweep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::RequestKey;

/// Limits for one partition. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvictionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
}

/// Age and write order of a stored entry, used to pick victims.
#[derive(Debug, Clone)]
pub struct EntryStamp {
    pub key: RequestKey,
    pub stored_at: DateTime<Utc>,
    /// Monotonic write counter; breaks ties between equal timestamps.
    pub seq: u64,
}

impl EvictionPolicy {
    /// No limits.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Limit only the number of entries.
    pub fn max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_age_seconds: None,
        }
    }

    /// Add an age limit.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_seconds = Some(max_age.as_secs());
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_entries.is_none() && self.max_age_seconds.is_none()
    }

    /// Whether an entry stored at `stored_at` has outlived the age limit.
    pub fn is_expired(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.max_age_seconds {
            Some(max_age) => (now - stored_at).num_seconds() > max_age as i64,
            None => false,
        }
    }

    /// Keys to delete so the partition satisfies this policy.
    ///
    /// Expired entries go first, then the oldest survivors until the count
    /// fits `max_entries`.
    pub fn victims(&self, entries: &[EntryStamp], now: DateTime<Utc>) -> Vec<RequestKey> {
        if self.is_unbounded() {
            return Vec::new();
        }

        let (expired, mut live): (Vec<&EntryStamp>, Vec<&EntryStamp>) = entries
            .iter()
            .partition(|stamp| self.is_expired(stamp.stored_at, now));

        let mut victims: Vec<RequestKey> = expired.into_iter().map(|s| s.key.clone()).collect();

        if let Some(max) = self.max_entries {
            if live.len() > max {
                live.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then(a.seq.cmp(&b.seq)));
                let excess = live.len() - max;
                victims.extend(live.into_iter().take(excess).map(|s| s.key.clone()));
            }
        }

        victims
    }
}
