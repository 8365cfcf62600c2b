//! Install / activate state machine.
//!
//! ```text
//! Installing ──install ok──▶ Waiting ──skip_waiting + activate──▶ Activating ──▶ Active
//!      │
//!      └──install failed──▶ Redundant
//! ```
//!
//! Transitions only move forward. A failed install leaves this generation
//! redundant; the host starts over with a fresh controller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use hashbrown::HashSet;
use http::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{LifecycleError, StoreError};
use crate::fetch::Fetcher;
use crate::partition::{GcReport, PartitionId, PartitionManager, Purpose};
use crate::policy::EvictionPolicy;
use crate::request::{KeyNormalizer, RequestDescriptor};
use crate::response::{CacheEntry, CachedResponse};
use crate::store::CacheStore;

/// Lifecycle state of one worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Pre-warming partitions.
    Installing,
    /// Installed; waiting for the host to let it take over.
    Waiting,
    /// Collecting stale partitions.
    Activating,
    /// Serving traffic.
    Active,
    /// Install failed; this generation will never serve traffic.
    Redundant,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Installing => "installing",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Redundant => "redundant",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events published to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// State changed.
    StateChange {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// Stale partitions deleted during activation.
    PartitionsCollected { deleted: Vec<PartitionId> },
    /// This generation now controls traffic.
    ControllerChange { version: String },
}

/// Partitions to create and resources to pre-warm on install.
#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    policies: BTreeMap<Purpose, EvictionPolicy>,
    manifest: Vec<(Purpose, Url)>,
    normalizer: KeyNormalizer,
}

impl InstallPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a purpose and its eviction policy.
    pub fn partition(mut self, purpose: impl Into<Purpose>, policy: EvictionPolicy) -> Self {
        self.policies.insert(purpose.into(), policy);
        self
    }

    /// Add a resource to pre-warm into `purpose`'s partition.
    pub fn resource(mut self, purpose: impl Into<Purpose>, url: Url) -> Self {
        self.manifest.push((purpose.into(), url));
        self
    }

    pub fn normalizer(mut self, normalizer: KeyNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn policies(&self) -> &BTreeMap<Purpose, EvictionPolicy> {
        &self.policies
    }

    pub fn manifest(&self) -> &[(Purpose, Url)] {
        &self.manifest
    }
}

/// Drives one worker generation from install to active.
pub struct LifecycleController {
    partitions: Arc<RwLock<PartitionManager>>,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    plan: InstallPlan,
    state: watch::Sender<LifecycleState>,
    skip_waiting: AtomicBool,
    /// Serializes transitions.
    transition: Mutex<()>,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleController {
    /// Create a controller in the `Installing` state.
    pub fn new(
        manager: PartitionManager,
        fetcher: Arc<dyn Fetcher>,
        plan: InstallPlan,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LifecycleState::Installing);

        (
            Self {
                store: manager.store().clone(),
                partitions: Arc::new(RwLock::new(manager)),
                fetcher,
                plan,
                state,
                skip_waiting: AtomicBool::new(false),
                transition: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Shared partition mapping. Writers hold the lock only while activating
    /// or clearing, so a read guard held across a request keeps activation out.
    pub fn partitions(&self) -> &Arc<RwLock<PartitionManager>> {
        &self.partitions
    }

    pub fn plan(&self) -> &InstallPlan {
        &self.plan
    }

    /// Pre-warm the manifest and create this version's partitions.
    ///
    /// All-or-nothing: every resource is fetched before anything is written,
    /// and a failed write removes the partitions this call created.
    pub async fn install(&self) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;
        self.expect_state("install", LifecycleState::Installing)?;

        info!(resources = self.plan.manifest.len(), "Installing");

        let responses = match self.fetch_manifest().await {
            Ok(responses) => responses,
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.transition_to(LifecycleState::Redundant);
                return Err(e);
            }
        };

        let mut manager = self.partitions.write().await;
        if let Err(source) = self.commit(&mut manager, responses).await {
            warn!(error = %source, "Install commit failed");
            manager.reset();
            drop(manager);
            self.transition_to(LifecycleState::Redundant);
            return Err(LifecycleError::Storage {
                action: "install",
                source,
            });
        }
        drop(manager);

        self.transition_to(LifecycleState::Waiting);
        Ok(())
    }

    /// Allow a waiting generation to activate. May be called while still
    /// installing; the signal is remembered.
    pub fn skip_waiting(&self) -> Result<(), LifecycleError> {
        if self.state() == LifecycleState::Redundant {
            return Err(LifecycleError::InvalidTransition {
                action: "skip waiting",
                state: LifecycleState::Redundant,
            });
        }
        debug!("Skip waiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_skip_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Collect stale partitions and start serving.
    ///
    /// Re-activating an active generation re-runs collection with the same
    /// keep set and leaves the same partitions behind.
    pub async fn activate(&self) -> Result<GcReport, LifecycleError> {
        let _transition = self.transition.lock().await;

        let state = self.state();
        match state {
            LifecycleState::Active => {}
            LifecycleState::Waiting if self.is_skip_waiting() => {}
            _ => {
                return Err(LifecycleError::InvalidTransition {
                    action: "activate",
                    state,
                })
            }
        }

        // Requests in flight finish against the old mapping before we proceed.
        let manager = self.partitions.write().await;
        if state == LifecycleState::Waiting {
            self.transition_to(LifecycleState::Activating);
        }

        let keep = manager.current().clone();
        let report = match manager.garbage_collect(&keep).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Could not list partitions for collection");
                GcReport::default()
            }
        };

        if !report.deleted.is_empty() {
            let _ = self.event_tx.send(LifecycleEvent::PartitionsCollected {
                deleted: report.deleted.clone(),
            });
        }

        if state == LifecycleState::Waiting {
            self.transition_to(LifecycleState::Active);
            info!(version = manager.version(), "Claimed control");
            let _ = self.event_tx.send(LifecycleEvent::ControllerChange {
                version: manager.version().to_string(),
            });
        }

        Ok(report)
    }

    /// Delete every partition, then recreate this version's partitions empty.
    pub async fn clear_partitions(&self) -> Result<usize, StoreError> {
        let manager = self.partitions.write().await;

        let existing = self.store.list_partitions().await?;
        for id in &existing {
            self.store.delete_partition(id).await?;
        }

        for (purpose, id) in manager.current() {
            let policy = manager.policy_for(purpose).unwrap_or_default();
            self.store.create_partition(id, policy).await?;
        }

        info!(deleted = existing.len(), "Cleared all partitions");
        Ok(existing.len())
    }

    fn expect_state(
        &self,
        action: &'static str,
        expected: LifecycleState,
    ) -> Result<(), LifecycleError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition { action, state })
        }
    }

    fn transition_to(&self, to: LifecycleState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(%from, %to, "Lifecycle state changed");
            let _ = self.event_tx.send(LifecycleEvent::StateChange { from, to });
        }
    }

    /// Fetch every manifest resource. Any transport error or non-2xx status
    /// fails the whole manifest.
    async fn fetch_manifest(&self) -> Result<Vec<(Purpose, Url, CachedResponse)>, LifecycleError> {
        let fetches = self.plan.manifest.iter().map(|(purpose, url)| async move {
            let request = RequestDescriptor::get(url.clone());
            let result = self.fetcher.fetch(&request).await;
            (purpose, url, result)
        });

        let mut responses = Vec::with_capacity(self.plan.manifest.len());
        for (purpose, url, result) in join_all(fetches).await {
            match result {
                Ok(response) if response.is_success() => {
                    responses.push((purpose.clone(), url.clone(), response));
                }
                Ok(response) => {
                    return Err(LifecycleError::InstallManifest {
                        url: url.to_string(),
                        reason: format!("status {}", response.status.as_u16()),
                    });
                }
                Err(e) => {
                    return Err(LifecycleError::InstallManifest {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(responses)
    }

    async fn commit(
        &self,
        manager: &mut PartitionManager,
        responses: Vec<(Purpose, Url, CachedResponse)>,
    ) -> Result<(), StoreError> {
        let preexisting: HashSet<PartitionId> =
            self.store.list_partitions().await?.into_iter().collect();

        let result = self.write_partitions(manager, responses).await;
        if result.is_err() {
            for (_, id) in manager.current() {
                if preexisting.contains(id) {
                    continue;
                }
                if let Err(e) = self.store.delete_partition(id).await {
                    warn!(partition = %id, error = %e, "Failed to remove partial install");
                }
            }
        }
        result
    }

    async fn write_partitions(
        &self,
        manager: &mut PartitionManager,
        responses: Vec<(Purpose, Url, CachedResponse)>,
    ) -> Result<(), StoreError> {
        for (purpose, policy) in &self.plan.policies {
            manager.ensure_current(purpose, *policy).await?;
        }

        for (purpose, url, response) in responses {
            let partition = match manager.current().get(&purpose) {
                Some(id) => id.clone(),
                None => manager.ensure_current(&purpose, EvictionPolicy::unbounded()).await?,
            };
            let key = self.plan.normalizer.key_for(&Method::GET, &url);
            debug!(partition = %partition, key = %key, "Pre-warmed");
            self.store.put(CacheEntry::new(partition, key, response)).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestKey;
    use crate::store::MemoryStore;
    use crate::testing::{FlakyStore, ScriptedFetcher};

    fn url(path: &str) -> Url {
        Url::parse("https://app.example").unwrap().join(path).unwrap()
    }

    fn plan() -> InstallPlan {
        InstallPlan::new()
            .partition("static", EvictionPolicy::unbounded())
            .partition("api", EvictionPolicy::max_entries(50))
            .resource("static", url("/"))
            .resource("static", url("/app.js"))
    }

    fn controller(
        store: Arc<dyn CacheStore>,
        fetcher: ScriptedFetcher,
    ) -> (LifecycleController, mpsc::UnboundedReceiver<LifecycleEvent>) {
        LifecycleController::new(PartitionManager::new("v2", store), Arc::new(fetcher), plan())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_install_prewarms_manifest() {
        let store = Arc::new(MemoryStore::new());
        let (controller, mut rx) = controller(store.clone(), ScriptedFetcher::ok("asset"));

        controller.install().await.unwrap();

        assert_eq!(controller.state(), LifecycleState::Waiting);
        let shell = PartitionId::new("static", "v2");
        assert_eq!(
            store.list_keys(&shell).await.unwrap(),
            vec![
                RequestKey::from_raw("GET https://app.example/"),
                RequestKey::from_raw("GET https://app.example/app.js"),
            ]
        );
        assert_eq!(store.entry_count(&PartitionId::new("api", "v2")).await.unwrap(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![LifecycleEvent::StateChange {
                from: LifecycleState::Installing,
                to: LifecycleState::Waiting,
            }]
        );
    }

    #[tokio::test]
    async fn test_install_failure_commits_nothing() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = ScriptedFetcher::ok("asset").failing_for("/app.js");
        let (controller, _rx) = controller(store.clone(), fetcher);

        let err = controller.install().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InstallManifest { ref url, .. } if url == "https://app.example/app.js"
        ));
        assert!(err.is_retryable());

        assert_eq!(controller.state(), LifecycleState::Redundant);
        assert!(store.list_partitions().await.unwrap().is_empty());
        assert!(controller.partitions().read().await.current().is_empty());

        // Never reaches Active
        controller.skip_waiting().unwrap_err();
        assert!(controller.activate().await.is_err());
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let store = Arc::new(MemoryStore::new());
        let (controller, _rx) = controller(
            store.clone(),
            ScriptedFetcher::status(http::StatusCode::SERVICE_UNAVAILABLE),
        );

        let err = controller.install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstallManifest { ref reason, .. } if reason == "status 503"));
        assert!(store.list_partitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_write_failure_rolls_back() {
        let store = Arc::new(FlakyStore::new());
        store.fail_writes(true);
        let (controller, _rx) = controller(store.clone(), ScriptedFetcher::ok("asset"));

        let err = controller.install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Storage { action: "install", .. }));
        assert_eq!(controller.state(), LifecycleState::Redundant);
        assert!(store.list_partitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activate_requires_skip_waiting() {
        let store = Arc::new(MemoryStore::new());
        let (controller, _rx) = controller(store, ScriptedFetcher::ok("asset"));

        assert!(matches!(
            controller.activate().await,
            Err(LifecycleError::InvalidTransition { state: LifecycleState::Installing, .. })
        ));

        controller.install().await.unwrap();
        assert!(matches!(
            controller.activate().await,
            Err(LifecycleError::InvalidTransition { state: LifecycleState::Waiting, .. })
        ));

        controller.skip_waiting().unwrap();
        controller.activate().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_activate_collects_previous_versions() {
        let store = Arc::new(MemoryStore::new());
        for old in ["static@v1", "api@v1", "fonts@v1"] {
            store
                .create_partition(&old.parse().unwrap(), EvictionPolicy::unbounded())
                .await
                .unwrap();
        }

        let (controller, mut rx) = controller(store.clone(), ScriptedFetcher::ok("asset"));
        controller.skip_waiting().unwrap();
        controller.install().await.unwrap();
        let report = controller.activate().await.unwrap();

        assert_eq!(report.deleted.len(), 3);
        assert_eq!(
            store.list_partitions().await.unwrap(),
            vec![PartitionId::new("api", "v2"), PartitionId::new("static", "v2")]
        );

        let events = drain(&mut rx);
        assert!(events.contains(&LifecycleEvent::StateChange {
            from: LifecycleState::Activating,
            to: LifecycleState::Active,
        }));
        assert!(events.iter().any(|e| matches!(e, LifecycleEvent::PartitionsCollected { deleted } if deleted.len() == 3)));
        assert_eq!(
            events.last(),
            Some(&LifecycleEvent::ControllerChange { version: "v2".to_string() })
        );
    }

    #[tokio::test]
    async fn test_reactivation_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_partition(&"static@v1".parse().unwrap(), EvictionPolicy::unbounded())
            .await
            .unwrap();

        let (controller, _rx) = controller(store.clone(), ScriptedFetcher::ok("asset"));
        controller.install().await.unwrap();
        controller.skip_waiting().unwrap();

        controller.activate().await.unwrap();
        let once = store.list_partitions().await.unwrap();

        let again = controller.activate().await.unwrap();
        assert!(again.deleted.is_empty());
        assert_eq!(store.list_partitions().await.unwrap(), once);
        assert_eq!(controller.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_gc_failure_does_not_block_activation() {
        let store = Arc::new(FlakyStore::new());
        let stale: PartitionId = "static@v1".parse().unwrap();
        store.create_partition(&stale, EvictionPolicy::unbounded()).await.unwrap();
        store.fail_delete_of(stale.clone());

        let (controller, _rx) = controller(store.clone(), ScriptedFetcher::ok("asset"));
        controller.install().await.unwrap();
        controller.skip_waiting().unwrap();

        let report = controller.activate().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.failed[0].0, stale);
        assert_eq!(controller.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_clear_partitions_recreates_current() {
        let store = Arc::new(MemoryStore::new());
        let (controller, _rx) = controller(store.clone(), ScriptedFetcher::ok("asset"));
        controller.install().await.unwrap();

        let deleted = controller.clear_partitions().await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.list_partitions().await.unwrap().len(), 2);
        assert_eq!(store.entry_count(&PartitionId::new("static", "v2")).await.unwrap(), 0);
    }
}
