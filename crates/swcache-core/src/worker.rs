//! Host-facing facade: the hooks a host environment calls.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{ConfigError, HandleError, LifecycleError};
use crate::fetch::Fetcher;
use crate::lifecycle::{LifecycleController, LifecycleEvent, LifecycleState};
use crate::partition::{GcReport, PartitionManager, Purpose};
use crate::refresher::BatchReport;
use crate::request::{RequestDescriptor, RequestKey};
use crate::response::ServedResponse;
use crate::store::CacheStore;
use crate::strategy::{StrategyConfig, StrategyExecutor};

/// Commands a host page can post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessage {
    SkipWaiting,
    GetVersion,
    ClearCache,
}

impl FromStr for HostMessage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SKIP_WAITING" => Ok(HostMessage::SkipWaiting),
            "GET_VERSION" => Ok(HostMessage::GetVersion),
            "CLEAR_CACHE" => Ok(HostMessage::ClearCache),
            other => Err(format!("unknown message type: {}", other)),
        }
    }
}

/// Reply to a [`HostMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageReply {
    Version {
        version: String,
    },
    Success {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl MessageReply {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => MessageReply::Success {
                success: true,
                error: None,
            },
            Err(e) => MessageReply::Success {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// One worker generation wired to a store and a network.
pub struct OfflineWorker {
    config: WorkerConfig,
    store: Arc<dyn CacheStore>,
    controller: LifecycleController,
    executor: StrategyExecutor,
}

impl OfflineWorker {
    /// Build a worker from a validated configuration.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LifecycleEvent>), ConfigError> {
        config.validate()?;

        let manager = PartitionManager::new(config.version.clone(), store.clone());
        let (controller, events) =
            LifecycleController::new(manager, fetcher.clone(), config.install_plan());
        let executor = StrategyExecutor::new(store.clone(), fetcher).with_normalizer(config.normalizer());

        Ok((
            Self {
                config,
                store,
                controller,
                executor,
            },
            events,
        ))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn state(&self) -> LifecycleState {
        self.controller.state()
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    /// Install hook.
    pub async fn install(&self) -> Result<(), LifecycleError> {
        self.controller.install().await?;
        if self.config.skip_waiting_on_install {
            self.controller.skip_waiting()?;
        }
        Ok(())
    }

    /// Activate hook.
    pub async fn activate(&self) -> Result<GcReport, LifecycleError> {
        self.controller.activate().await
    }

    pub fn skip_waiting(&self) -> Result<(), LifecycleError> {
        self.controller.skip_waiting()
    }

    /// Fetch hook.
    ///
    /// Until the worker is active every request goes straight to the network.
    pub async fn fetch(&self, request: &RequestDescriptor) -> Result<ServedResponse, HandleError> {
        // Held for the whole request so activation waits for it.
        let partitions = self.controller.partitions().read().await;

        if self.controller.state() != LifecycleState::Active {
            drop(partitions);
            return self.executor.pass_through(request).await;
        }

        let route = match self.config.routes.resolve(request) {
            Some(route) => route,
            None => {
                drop(partitions);
                return self.executor.pass_through(request).await;
            }
        };

        let config = StrategyConfig::new(route.strategy, partitions.resolve_partition(&route.purpose))
            .with_timeout(self.config.network_timeout());

        match self.executor.handle(request, &config).await {
            Err(HandleError::NotAvailable { key }) if request.is_navigation() => {
                self.offline_fallback(&partitions, key).await
            }
            result => result,
        }
    }

    async fn offline_fallback(
        &self,
        partitions: &PartitionManager,
        key: RequestKey,
    ) -> Result<ServedResponse, HandleError> {
        let Some(fallback) = &self.config.offline_fallback else {
            return Err(HandleError::NotAvailable { key });
        };

        let partition = partitions.resolve_partition(&Purpose::new("static"));
        let fallback_key = self.executor.normalizer().key_for(&Method::GET, fallback);
        match self.store.get(&partition, &fallback_key).await {
            Ok(Some(entry)) => {
                debug!(key = %key, "Serving offline fallback page");
                Ok(ServedResponse::from_cache(entry))
            }
            Ok(None) => Err(HandleError::NotAvailable { key }),
            Err(e) => {
                warn!(error = %e, "Failed to read offline fallback page");
                Err(HandleError::NotAvailable { key })
            }
        }
    }

    /// Message hook.
    pub async fn message(&self, message: HostMessage) -> MessageReply {
        debug!(?message, "Host message");
        match message {
            HostMessage::SkipWaiting => {
                let result = match self.controller.skip_waiting() {
                    Ok(()) if self.state() == LifecycleState::Waiting => {
                        self.controller.activate().await.map(|_| ())
                    }
                    other => other,
                };
                MessageReply::from_result(result)
            }
            HostMessage::GetVersion => MessageReply::Version {
                version: self.config.version.clone(),
            },
            HostMessage::ClearCache => {
                MessageReply::from_result(self.controller.clear_partitions().await.map(|_| ()))
            }
        }
    }

    /// Periodic sync hook. Returns `None` for tags this worker does not handle.
    pub async fn periodic_sync(&self, tag: &str) -> Option<BatchReport> {
        if tag != self.config.sync.tag {
            debug!(tag, "Ignoring unknown sync tag");
            return None;
        }

        let partitions = self.controller.partitions().read().await;
        let partition = partitions.resolve_partition(&self.config.sync.purpose);
        let normalizer = self.executor.normalizer();
        let targets: Vec<_> = self
            .config
            .sync
            .critical_endpoints
            .iter()
            .map(|url| {
                (
                    partition.clone(),
                    normalizer.key_for(&Method::GET, url),
                    RequestDescriptor::get(url.clone()),
                )
            })
            .collect();
        let total = targets.len();

        let report = match self.executor.refresher().refresh_batch(targets).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Periodic sync task failed");
                BatchReport {
                    refreshed: 0,
                    failed: total,
                }
            }
        };

        info!(tag, refreshed = report.refreshed, failed = report.failed, "Periodic sync complete");
        Some(report)
    }

    /// Run periodic sync every `interval` for hosts without a sync event.
    /// The first run happens one interval after the call.
    pub fn spawn_periodic_sync(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let tag = worker.config.sync.tag.clone();
                worker.periodic_sync(&tag).await;
            }
        })
    }
}
