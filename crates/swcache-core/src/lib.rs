//! # swcache
//!
//! Tiered HTTP response cache with pluggable fetch strategies, for hosts
//! that need an offline-capable web app to keep working without a network.
//!
//! ## Features
//!
//! - **Strategies**: cache-first, network-first with timeout, cache-first
//!   with background update, network-only
//! - **Partitions**: one versioned partition per purpose, with count and age
//!   limits; stale versions are collected on activation
//! - **Lifecycle**: install (all-or-nothing pre-warm), waiting, activate
//! - **Storage**: in-memory and SQLite stores behind one trait
//! - **Background revalidation** and periodic sync of critical endpoints
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker (host hooks: install / activate / fetch / message / sync)
//!     │
//!     ├── LifecycleController
//!     │       └── PartitionManager (purpose → purpose@version)
//!     │
//!     ├── RouteTable (request → strategy + purpose)
//!     │
//!     └── StrategyExecutor
//!             ├── CacheStore (partition → key → entry)
//!             ├── Fetcher (network)
//!             └── BackgroundRefresher
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod install_prompt;
pub mod lifecycle;
pub mod partition;
pub mod policy;
pub mod refresher;
pub mod request;
pub mod response;
pub mod routes;
pub mod store;
pub mod strategy;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{SyncConfig, WorkerConfig};
pub use error::{ConfigError, FetchError, HandleError, LifecycleError, StoreError};
pub use fetch::Fetcher;
pub use install_prompt::{DeferredPrompt, InstallPrompt, PromptOutcome};
pub use lifecycle::{InstallPlan, LifecycleController, LifecycleEvent, LifecycleState};
pub use partition::{GcReport, PartitionId, PartitionManager, Purpose};
pub use policy::EvictionPolicy;
pub use refresher::{BackgroundRefresher, BatchReport};
pub use request::{KeyNormalizer, RequestDescriptor, RequestKey, RequestMode};
pub use response::{CacheEntry, CachedResponse, FetchOutcome, ResponseSource, ServedResponse};
pub use routes::{Route, RouteMatcher, RouteTable};
pub use store::{CacheStore, MemoryStore, SqliteStore};
pub use strategy::{Strategy, StrategyConfig, StrategyExecutor};
pub use worker::{HostMessage, MessageReply, OfflineWorker};
