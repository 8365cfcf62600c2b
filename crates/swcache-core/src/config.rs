//! Worker configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::lifecycle::InstallPlan;
use crate::partition::Purpose;
use crate::policy::EvictionPolicy;
use crate::request::{KeyNormalizer, DEFAULT_VOLATILE_PARAMS};
use crate::routes::{Route, RouteMatcher, RouteTable};
use crate::strategy::Strategy;

/// Periodic sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tag the host fires periodic sync with
    pub tag: String,
    /// Purpose whose partition holds the critical endpoints
    pub purpose: Purpose,
    /// Endpoints revalidated on every sync
    pub critical_endpoints: Vec<Url>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tag: "content-sync".to_string(),
            purpose: Purpose::new("api"),
            critical_endpoints: Vec::new(),
        }
    }
}

/// Offline worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Version tag shared by every current partition
    pub version: String,

    /// Eviction policy per purpose; every purpose used elsewhere must be listed
    pub partitions: BTreeMap<Purpose, EvictionPolicy>,

    /// Resources pre-warmed on install, by purpose
    pub manifest: BTreeMap<Purpose, Vec<Url>>,

    /// Routing rules, first match wins
    pub routes: RouteTable,

    /// Network timeout for network-first routes (milliseconds)
    pub network_timeout_ms: u64,

    /// Query parameters ignored when building cache keys
    pub volatile_params: Vec<String>,

    /// Periodic sync
    pub sync: SyncConfig,

    /// Page served to navigations that are not available offline
    pub offline_fallback: Option<Url>,

    /// Activate as soon as install completes
    pub skip_waiting_on_install: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(Purpose::new("static"), EvictionPolicy::unbounded());
        partitions.insert(
            Purpose::new("api"),
            EvictionPolicy::max_entries(50).with_max_age(Duration::from_secs(24 * 60 * 60)),
        );
        partitions.insert(
            Purpose::new("fonts"),
            EvictionPolicy::max_entries(30).with_max_age(Duration::from_secs(365 * 24 * 60 * 60)),
        );
        partitions.insert(
            Purpose::new("images"),
            EvictionPolicy::max_entries(60).with_max_age(Duration::from_secs(30 * 24 * 60 * 60)),
        );

        Self {
            version: "v1".to_string(),
            partitions,
            manifest: BTreeMap::new(),
            routes: RouteTable::new(vec![
                Route::new(RouteMatcher::Navigation, Strategy::NetworkFirst, "static"),
                Route::new(
                    RouteMatcher::PathPrefix {
                        prefix: "/api/".to_string(),
                    },
                    Strategy::NetworkFirst,
                    "api",
                ),
                Route::new(
                    RouteMatcher::Extension {
                        extensions: vec!["woff".into(), "woff2".into(), "ttf".into()],
                    },
                    Strategy::CacheFirst,
                    "fonts",
                ),
                Route::new(
                    RouteMatcher::Extension {
                        extensions: vec![
                            "png".into(),
                            "jpg".into(),
                            "jpeg".into(),
                            "svg".into(),
                            "webp".into(),
                        ],
                    },
                    Strategy::CacheFirst,
                    "images",
                ),
                Route::new(
                    RouteMatcher::Extension {
                        extensions: vec!["js".into(), "css".into()],
                    },
                    Strategy::CacheFirstWithBackgroundUpdate,
                    "static",
                ),
            ]),
            network_timeout_ms: 3_000,
            volatile_params: DEFAULT_VOLATILE_PARAMS.iter().map(|p| p.to_string()).collect(),
            sync: SyncConfig::default(),
            offline_fallback: None,
            skip_waiting_on_install: false,
        }
    }
}

impl WorkerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references between sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".to_string()));
        }
        if self.version.contains('@') {
            return Err(ConfigError::Invalid(format!(
                "version '{}' must not contain '@'",
                self.version
            )));
        }
        if self.network_timeout_ms == 0 {
            return Err(ConfigError::Invalid("network_timeout_ms must be positive".to_string()));
        }

        for route in self.routes.routes() {
            self.check_purpose(&route.purpose, "route")?;
        }
        for purpose in self.manifest.keys() {
            self.check_purpose(purpose, "manifest")?;
        }
        if !self.sync.critical_endpoints.is_empty() {
            self.check_purpose(&self.sync.purpose, "sync")?;
        }
        if self.offline_fallback.is_some() && !self.partitions.contains_key(&Purpose::new("static")) {
            return Err(ConfigError::Invalid(
                "offline_fallback requires a 'static' partition".to_string(),
            ));
        }

        // Pre-warmed entries share their partition with runtime writes and
        // must never be evicted.
        for purpose in self.prewarmed_purposes() {
            if let Some(policy) = self.partitions.get(&purpose) {
                if !policy.is_unbounded() {
                    return Err(ConfigError::Invalid(format!(
                        "partition '{}' holds pre-warmed resources and must be unbounded",
                        purpose
                    )));
                }
            }
        }

        Ok(())
    }

    fn prewarmed_purposes(&self) -> Vec<Purpose> {
        let mut purposes: Vec<Purpose> = self
            .manifest
            .iter()
            .filter(|(_, urls)| !urls.is_empty())
            .map(|(purpose, _)| purpose.clone())
            .collect();
        if self.offline_fallback.is_some() {
            purposes.push(Purpose::new("static"));
        }
        purposes
    }

    fn check_purpose(&self, purpose: &Purpose, section: &str) -> Result<(), ConfigError> {
        if self.partitions.contains_key(purpose) {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "{} references unknown purpose '{}'",
                section, purpose
            )))
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn normalizer(&self) -> KeyNormalizer {
        KeyNormalizer::new(self.volatile_params.iter().cloned())
    }

    /// Install plan for this configuration. The offline fallback page is
    /// pre-warmed into the static partition.
    pub fn install_plan(&self) -> InstallPlan {
        let mut plan = InstallPlan::new().normalizer(self.normalizer());
        for (purpose, policy) in &self.partitions {
            plan = plan.partition(purpose.clone(), *policy);
        }
        for (purpose, urls) in &self.manifest {
            for url in urls {
                plan = plan.resource(purpose.clone(), url.clone());
            }
        }
        if let Some(fallback) = &self.offline_fallback {
            let static_purpose = Purpose::new("static");
            let already_listed = self
                .manifest
                .get(&static_purpose)
                .is_some_and(|urls| urls.contains(fallback));
            if !already_listed {
                plan = plan.resource("static", fallback.clone());
            }
        }
        plan
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}
