//! Relay configuration.
//!
//! Settings come from command-line flags, each with an environment variable
//! fallback. [`RelayConfig::from_cli`] validates them before any I/O happens.

use crate::error::RelayError;
use crate::kv::StoreConfig;
use crate::retry::RetryPolicy;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Default registry replication endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://replicate.npmjs.com";

/// Command-line interface.
#[derive(Debug, Parser)]
#[command(name = "intervention-relay", version, about)]
pub struct Cli {
    /// Directory for the durable store.
    #[arg(long, env = "RELAY_STORE_PATH", default_value = "./intervention-relay.db")]
    pub store_path: PathBuf,

    /// Registry replication endpoint.
    #[arg(long, env = "RELAY_REGISTRY_URL", default_value = DEFAULT_REGISTRY_URL)]
    pub registry_url: String,

    /// Handle to track on the notification channel (required).
    #[arg(long, env = "RELAY_TRACK_HANDLE")]
    pub track_handle: Option<String>,

    /// How often to check whether backfill has caught up, in milliseconds.
    #[arg(long, env = "RELAY_POLL_INTERVAL_MS", default_value_t = 250)]
    pub poll_interval_ms: u64,

    /// Changes requested per feed page.
    #[arg(long, env = "RELAY_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Delay before re-polling an exhausted feed, in milliseconds.
    #[arg(long, env = "RELAY_IDLE_INTERVAL_MS", default_value_t = 5000)]
    pub idle_interval_ms: u64,

    /// Attempts for the startup target fetch.
    #[arg(long, env = "RELAY_FETCH_ATTEMPTS", default_value_t = 5)]
    pub fetch_attempts: u32,

    /// Log filter directives (overrides RUST_LOG).
    #[arg(long, env = "RELAY_LOG")]
    pub log: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Validated relay settings.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub store: StoreConfig,
    pub registry_url: String,
    pub track_handle: String,
    pub poll_interval: Duration,
    pub idle_interval: Duration,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            track_handle: String::new(),
            poll_interval: Duration::from_millis(250),
            idle_interval: Duration::from_secs(5),
            batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Build from parsed flags.
    pub fn from_cli(cli: &Cli) -> Result<Self, RelayError> {
        let config = Self {
            store: StoreConfig {
                path: cli.store_path.clone(),
                ..Default::default()
            },
            registry_url: cli.registry_url.trim_end_matches('/').to_string(),
            track_handle: cli.track_handle.clone().unwrap_or_default(),
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            idle_interval: Duration::from_millis(cli.idle_interval_ms),
            batch_size: cli.batch_size,
            retry: RetryPolicy {
                max_attempts: cli.fetch_attempts,
                ..Default::default()
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.track_handle.trim().is_empty() {
            return Err(RelayError::Config(
                "RELAY_TRACK_HANDLE (--track-handle) is required".into(),
            ));
        }
        if !(self.registry_url.starts_with("http://") || self.registry_url.starts_with("https://"))
        {
            return Err(RelayError::Config(format!(
                "registry url must be http(s): {}",
                self.registry_url
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(RelayError::Config("poll interval must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(RelayError::Config("batch size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(RelayError::Config("fetch attempts must be positive".into()));
        }
        Ok(())
    }

    /// Track term handed to the notification sink.
    pub fn track_term(&self) -> String {
        format!("@{}", self.track_handle.trim_start_matches('@'))
    }
}
