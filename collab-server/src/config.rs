//! Configuration loading for collab-server.
//!
//! Configuration is loaded from a TOML file (default: `collab.toml`). Every
//! section and field is optional.

use collab_core::{DebouncePolicy, LeaseTiming, ReconnectPolicy};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for collab-server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Cross-instance sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Document persistence configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Document lock configuration.
    #[serde(default)]
    pub locks: LocksConfig,
    /// Backend reconnect backoff.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP and WebSocket traffic (default: 0.0.0.0:3001).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Path prefix of the WebSocket route (default: /collab).
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// Keepalive ping interval in seconds (default: 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

/// Cross-instance sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Coordinate with sibling instances (default: true).
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    /// Prefix of channel and lock keys (default: collab).
    #[serde(default = "default_sync_prefix")]
    pub prefix: String,
    /// Redis server shared by every instance (default: redis://127.0.0.1:6379).
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

/// Document persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Quiet period before a dirty document is written (default: 10s).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Longest a change may stay unwritten (default: 45s).
    #[serde(default = "default_max_debounce_ms")]
    pub max_debounce_ms: u64,
    /// Delay before retrying a failed write (default: 5s).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Document lock configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocksConfig {
    /// Lease time-to-live in milliseconds (default: 30s).
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
    /// Renewal interval in milliseconds, must be shorter than the TTL (default: 10s).
    #[serde(default = "default_lock_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

/// Backend reconnect backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds (default: 100).
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    /// Maximum delay in milliseconds (default: 10000).
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Maximum random jitter in milliseconds (default: 250).
    #[serde(default = "default_backoff_jitter_ms")]
    pub jitter_ms: u64,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long connections get to close before being force-detached (default: 10s).
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_path_prefix() -> String {
    "/collab".to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_prefix() -> String {
    "collab".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("collab.db")
}

fn default_debounce_ms() -> u64 {
    10_000
}

fn default_max_debounce_ms() -> u64 {
    45_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_renew_interval_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_backoff_jitter_ms() -> u64 {
    250
}

fn default_grace_secs() -> u64 {
    10
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            path_prefix: default_path_prefix(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            prefix: default_sync_prefix(),
            redis_url: default_redis_url(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            debounce_ms: default_debounce_ms(),
            max_debounce_ms: default_max_debounce_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            renew_interval_ms: default_lock_renew_interval_ms(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lease_timing()
            .validate()
            .map_err(|reason| ConfigError::Invalid { reason })?;

        if self.persistence.debounce_ms == 0 {
            return Err(invalid("persistence.debounce_ms must be greater than zero"));
        }
        if self.persistence.max_debounce_ms < self.persistence.debounce_ms {
            return Err(invalid(
                "persistence.max_debounce_ms must not be shorter than debounce_ms",
            ));
        }
        if self.backoff.base_ms == 0 || self.backoff.max_ms < self.backoff.base_ms {
            return Err(invalid("backoff.base_ms must be non-zero and at most max_ms"));
        }
        if self.server.ping_interval_secs == 0 {
            return Err(invalid("server.ping_interval_secs must be greater than zero"));
        }
        if self.sync.prefix.is_empty() {
            return Err(invalid("sync.prefix must not be empty"));
        }
        if self.sync.enabled && self.sync.redis_url.is_empty() {
            return Err(invalid("sync.redis_url must be set when sync is enabled"));
        }
        if !self.server.path_prefix.starts_with('/') {
            return Err(invalid("server.path_prefix must start with '/'"));
        }
        Ok(())
    }

    /// Debounce timings for persistence.
    pub fn debounce_policy(&self) -> DebouncePolicy {
        DebouncePolicy {
            debounce: Duration::from_millis(self.persistence.debounce_ms),
            max_debounce: Duration::from_millis(self.persistence.max_debounce_ms),
        }
    }

    /// Delay before retrying a failed write.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.persistence.retry_delay_ms)
    }

    /// Lock lease timings.
    pub fn lease_timing(&self) -> LeaseTiming {
        LeaseTiming {
            ttl: Duration::from_millis(self.locks.ttl_ms),
            renew_interval: Duration::from_millis(self.locks.renew_interval_ms),
        }
    }

    /// Backend reconnect policy.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.backoff.base_ms),
            max: Duration::from_millis(self.backoff.max_ms),
            jitter: Duration::from_millis(self.backoff.jitter_ms),
        }
    }

    /// Keepalive ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.server.ping_interval_secs)
    }

    /// Drain grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_secs)
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_string(),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Values parsed but are inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}
