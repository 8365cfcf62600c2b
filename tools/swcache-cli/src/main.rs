//! Host harness for the swcache offline worker.
//!
//! Boots one worker generation against a SQLite store and the real network,
//! then drives it the way a browser host would.
//!
//! ## Usage
//!
//! ```bash
//! # Install, activate and serve two URLs
//! swcache --config config/worker.json fetch https://app.example/ https://app.example/api/leaderboard
//!
//! # Inspect what is on disk
//! swcache --db swcache.db partitions
//!
//! # Post a host message
//! swcache message CLEAR_CACHE
//!
//! # Revalidate critical endpoints once
//! swcache sync
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use swcache_common::{init_logging, retry_if, LogConfig, LogFormat, RetryConfig};
use swcache_core::{
    CacheStore, ConfigError, Fetcher, GcReport, HostMessage, LifecycleError, OfflineWorker,
    RequestDescriptor, SqliteStore, WorkerConfig,
};
use swcache_net::{FetcherConfig, HttpFetcher};

#[derive(Parser)]
#[command(name = "swcache")]
#[command(about = "Drive an offline cache worker from the command line")]
struct Cli {
    /// Worker configuration (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite cache database
    #[arg(long, global = true, default_value = "swcache.db")]
    db: PathBuf,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the worker and serve each URL through it
    Fetch {
        /// URLs to request
        #[arg(required = true)]
        urls: Vec<String>,
        /// Treat the requests as page navigations
        #[arg(long)]
        navigate: bool,
        /// Install attempts before giving up
        #[arg(long, default_value = "3")]
        attempts: u32,
    },

    /// List partitions and their entry counts
    Partitions,

    /// Post a message to a booted worker
    Message {
        /// SKIP_WAITING, GET_VERSION or CLEAR_CACHE
        kind: HostMessage,
    },

    /// Run the periodic-sync revalidation once
    Sync,
}

#[derive(Error, Debug)]
enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl BootError {
    fn is_retryable(&self) -> bool {
        match self {
            BootError::Config(_) => false,
            BootError::Lifecycle(e) => e.is_retryable(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format)) {
        eprintln!("Logging disabled: {}", e);
    }

    let config = load_config(cli.config.as_deref())?;
    let store: Arc<dyn CacheStore> = Arc::new(SqliteStore::open(&cli.db)?);

    match cli.command {
        Commands::Fetch {
            urls,
            navigate,
            attempts,
        } => {
            let retry = RetryConfig {
                max_attempts: attempts,
                ..Default::default()
            };
            let worker = boot(&config, store, &retry).await?;

            let mut failures = 0;
            for raw in &urls {
                let request = match RequestDescriptor::parse(raw) {
                    Ok(request) if navigate => RequestDescriptor::navigate(request.url),
                    Ok(request) => request,
                    Err(e) => {
                        eprintln!("{}: invalid URL: {}", raw, e);
                        failures += 1;
                        continue;
                    }
                };

                match worker.fetch(&request).await {
                    Ok(served) => println!(
                        "{} {:<7} {:>8} bytes  {}",
                        served.response.status.as_u16(),
                        served.source.as_str(),
                        served.response.size(),
                        request.url
                    ),
                    Err(e) => {
                        println!("ERR {:<7} {:>8}        {}  ({})", "-", "-", request.url, e);
                        failures += 1;
                    }
                }
            }

            if failures > 0 {
                std::process::exit(1);
            }
        }

        Commands::Partitions => {
            let mut partitions = store.list_partitions().await?;
            partitions.sort();

            if partitions.is_empty() {
                println!("No partitions in {}", cli.db.display());
            }
            for id in partitions {
                let count = store.entry_count(&id).await?;
                println!("{:<24} {:>6} entries", id.to_string(), count);
            }
        }

        Commands::Message { kind } => {
            let worker = if kind == HostMessage::GetVersion {
                // Answering with the version needs no install
                let (worker, _events) = OfflineWorker::new(config, store, fetcher()?)?;
                worker
            } else {
                boot(&config, store, &RetryConfig::default()).await?
            };

            let reply = worker.message(kind).await;
            println!("{}", serde_json::to_string(&reply)?);
        }

        Commands::Sync => {
            let worker = boot(&config, store, &RetryConfig::default()).await?;
            let tag = worker.config().sync.tag.clone();

            match worker.periodic_sync(&tag).await {
                Some(report) => {
                    println!("Refreshed: {}", report.refreshed);
                    println!("Failed:    {}", report.failed);
                    if report.failed > 0 {
                        std::process::exit(1);
                    }
                }
                None => println!("Nothing registered for sync tag {}", tag),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig, ConfigError> {
    match path {
        Some(path) => {
            let config = WorkerConfig::load(path)?;
            info!(path = %path.display(), version = %config.version, "Loaded worker config");
            Ok(config)
        }
        None => {
            info!("Using default worker config");
            Ok(WorkerConfig::default())
        }
    }
}

fn fetcher() -> Result<Arc<dyn Fetcher>, swcache_net::NetError> {
    Ok(Arc::new(HttpFetcher::new(FetcherConfig::default())?))
}

/// Number of collected partitions and the names of those that failed.
fn collection_summary(report: &GcReport) -> (usize, Vec<String>) {
    let failed = report.failed.iter().map(|(id, _)| id.to_string()).collect();
    (report.deleted.len(), failed)
}

/// Install a fresh generation (retrying with backoff), then activate it.
///
/// A failed install leaves its generation redundant, so every attempt
/// builds a new worker.
async fn boot(
    config: &WorkerConfig,
    store: Arc<dyn CacheStore>,
    retry: &RetryConfig,
) -> Result<OfflineWorker, Box<dyn std::error::Error>> {
    let fetcher = fetcher()?;

    let worker = retry_if(retry, BootError::is_retryable, || {
        let config = config.clone();
        let store = store.clone();
        let fetcher = fetcher.clone();
        async move {
            let (worker, _events) = OfflineWorker::new(config, store, fetcher)?;
            worker.skip_waiting()?;
            worker.install().await?;
            Ok::<_, BootError>(worker)
        }
    })
    .await?;

    let report = worker.activate().await?;
    let (deleted, failed) = collection_summary(&report);
    if deleted > 0 {
        info!(deleted, "Collected previous generations");
    }
    if !failed.is_empty() {
        warn!(?failed, "Some previous generations could not be deleted");
    }

    Ok(worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use swcache_core::{PartitionId, StoreError};

    #[test]
    fn test_clean_collection_is_reported() {
        let report = GcReport {
            deleted: vec![PartitionId::new("static", "v1"), PartitionId::new("api", "v1")],
            failed: Vec::new(),
        };
        assert_eq!(collection_summary(&report), (2, Vec::new()));
    }

    #[test]
    fn test_failed_deletions_are_named() {
        let report = GcReport {
            deleted: Vec::new(),
            failed: vec![(
                PartitionId::new("images", "v1"),
                StoreError::Backend("database is locked".to_string()),
            )],
        };
        assert_eq!(collection_summary(&report), (0, vec!["images@v1".to_string()]));
    }

    #[test]
    fn test_cli_parses_message_kind() {
        let cli = Cli::try_parse_from(["swcache", "--db", "cache.db", "message", "CLEAR_CACHE"]).unwrap();
        assert!(matches!(cli.command, Commands::Message { kind: HostMessage::ClearCache }));
        assert!(Cli::try_parse_from(["swcache", "message", "RELOAD"]).is_err());
    }
}
