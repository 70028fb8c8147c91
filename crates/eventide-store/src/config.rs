//! Configuration for the event store and integration client.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::hasura::HasuraConfig;

const CONFIG_FILE: &str = "eventide.toml";

/// Store configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`eventide.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use eventide_store::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("Writing events to {}", config.hasura_url);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the Hasura instance.
    ///
    /// Environment variable: `HASURA_URL`
    #[serde(default = "default_hasura_url")]
    pub hasura_url: String,
    /// Hasura admin secret.
    ///
    /// Environment variable: `HASURA_GRAPHQL_ADMIN_SECRET`
    #[serde(default = "default_admin_secret")]
    pub hasura_graphql_admin_secret: String,
    /// Timeout for each GraphQL request in seconds.
    ///
    /// Environment variable: `GRAPH_REQUEST_TIMEOUT_SECONDS`
    #[serde(default = "default_timeout")]
    pub graph_request_timeout_seconds: u64,
    /// Default chunk size for bulk writes.
    ///
    /// Environment variable: `BULK_EVENTS_BATCH_SIZE`
    #[serde(default = "default_batch_size")]
    pub bulk_events_batch_size: usize,
    /// Timeout for downstream integration calls in seconds.
    ///
    /// Environment variable: `API_CALL_TIMEOUT`
    #[serde(default = "default_timeout")]
    pub api_call_timeout: u64,
    /// Unique constraint on `event_processed_logs.event_id` used for
    /// conflict-safe log inserts.
    ///
    /// Environment variable: `EVENT_LOG_CONFLICT_CONSTRAINT`
    #[serde(default)]
    pub event_log_conflict_constraint: Option<String>,
    /// Lifetime of cached access tokens in seconds.
    ///
    /// Environment variable: `TOKEN_CACHE_TTL_SECONDS`
    #[serde(default = "default_token_ttl")]
    pub token_cache_ttl_seconds: u64,
    /// Log filter.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `eventide.toml`, and environment
    /// variable overrides.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or a value is out of range.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Same as [`Config::load`] with an explicit configuration file path.
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or a value is out of range.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Connection settings for the Hasura graph store.
    pub fn to_hasura_config(&self) -> HasuraConfig {
        HasuraConfig {
            url: self.hasura_url.clone(),
            admin_secret: self.hasura_graphql_admin_secret.clone(),
            timeout: Duration::from_secs(self.graph_request_timeout_seconds),
            log_conflict_constraint: self.event_log_conflict_constraint.clone(),
        }
    }

    /// Timeout for downstream integration calls.
    pub fn api_call_timeout(&self) -> Duration {
        Duration::from_secs(self.api_call_timeout)
    }

    /// Lifetime of cached access tokens.
    pub fn token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.token_cache_ttl_seconds)
    }

    /// Admin secret with everything but the first character masked, for
    /// logging.
    pub fn admin_secret_masked(&self) -> String {
        let mut chars = self.hasura_graphql_admin_secret.chars();
        match chars.next() {
            Some(first) => format!("{first}***"),
            None => String::new(),
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Names the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !(self.hasura_url.starts_with("http://") || self.hasura_url.starts_with("https://")) {
            anyhow::bail!("hasura_url must start with http:// or https://");
        }

        if self.graph_request_timeout_seconds == 0 {
            anyhow::bail!("graph_request_timeout_seconds must be greater than 0");
        }

        if self.bulk_events_batch_size == 0 {
            anyhow::bail!("bulk_events_batch_size must be greater than 0");
        }

        if self.api_call_timeout == 0 {
            anyhow::bail!("api_call_timeout must be greater than 0");
        }

        if self.token_cache_ttl_seconds == 0 {
            anyhow::bail!("token_cache_ttl_seconds must be greater than 0");
        }

        if EnvFilter::try_new(&self.rust_log).is_err() {
            anyhow::bail!("rust_log must be a valid tracing filter");
        }

        if let Some(constraint) = &self.event_log_conflict_constraint {
            let valid = !constraint.is_empty()
                && constraint.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !constraint.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                anyhow::bail!("event_log_conflict_constraint must be a GraphQL identifier");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hasura_url: default_hasura_url(),
            hasura_graphql_admin_secret: default_admin_secret(),
            graph_request_timeout_seconds: default_timeout(),
            bulk_events_batch_size: default_batch_size(),
            api_call_timeout: default_timeout(),
            event_log_conflict_constraint: None,
            token_cache_ttl_seconds: default_token_ttl(),
            rust_log: default_log_level(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("hasura_url", &self.hasura_url)
            .field("hasura_graphql_admin_secret", &self.admin_secret_masked())
            .field("graph_request_timeout_seconds", &self.graph_request_timeout_seconds)
            .field("bulk_events_batch_size", &self.bulk_events_batch_size)
            .field("api_call_timeout", &self.api_call_timeout)
            .field("event_log_conflict_constraint", &self.event_log_conflict_constraint)
            .field("token_cache_ttl_seconds", &self.token_cache_ttl_seconds)
            .field("rust_log", &self.rust_log)
            .finish()
    }
}

fn default_hasura_url() -> String {
    "http://hasura:8080".to_string()
}

fn default_admin_secret() -> String {
    "admin".to_string()
}

fn default_timeout() -> u64 {
    crate::DEFAULT_TIMEOUT_SECONDS
}

fn default_batch_size() -> usize {
    crate::DEFAULT_BATCH_SIZE
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}
