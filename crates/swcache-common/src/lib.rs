//! # swcache common
//!
//! Shared plumbing for the swcache workspace.
//!
//! - Logging configuration and subscriber setup
//! - Retry with exponential backoff for host-driven operations (e.g. a failed
//!   install that the host wants to run again from scratch)

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_if, retry_with_backoff, RetryConfig};
