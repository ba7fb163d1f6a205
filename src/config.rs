//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::admission::KeyStrategy;
use crate::bucket::{Policy, DEFAULT_SHARDS};
use crate::error::{Result, TollgateError};

/// Prefix of environment variables overriding file settings,
/// e.g. `TOLLGATE__STORE__REMOTE_ADDR`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token-bucket configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the admission (`Gate`) gRPC service
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Token-bucket configuration, shared by every caller key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Maximum tokens per bucket
    #[serde(default = "default_capacity")]
    pub capacity: i64,

    /// Tokens charged when a check does not name a cost
    #[serde(default = "default_cost")]
    pub cost_per_request: i64,

    /// Deadline for the store work of one check in milliseconds, 0 for none
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Lock shards guarding a process-local store
    #[serde(default = "default_guard_shards")]
    pub guard_shards: usize,

    /// How caller keys are derived
    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Header carrying the caller's API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            cost_per_request: default_cost(),
            store_timeout_ms: default_store_timeout(),
            guard_shards: default_guard_shards(),
            key_strategy: KeyStrategy::default(),
            api_key_header: default_api_key_header(),
        }
    }
}

fn default_rate() -> f64 {
    10.0
}

fn default_capacity() -> i64 {
    20
}

fn default_cost() -> i64 {
    1
}

fn default_store_timeout() -> u64 {
    250
}

fn default_guard_shards() -> usize {
    DEFAULT_SHARDS
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

impl LimiterConfig {
    /// The bucket policy described by this configuration.
    pub fn policy(&self) -> Result<Policy> {
        Policy::new(self.rate, self.capacity)
    }

    /// The store deadline, if any.
    pub fn store_timeout(&self) -> Option<Duration> {
        (self.store_timeout_ms > 0).then(|| Duration::from_millis(self.store_timeout_ms))
    }
}

/// Which backend holds bucket state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-owned table; one instance only
    #[default]
    Memory,
    /// Shared bucket-store server
    Remote,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend used by `tollgate serve`
    #[serde(default)]
    pub kind: StoreKind,

    /// Address of the shared bucket store, e.g. `http://10.0.0.5:8091`
    #[serde(default)]
    pub remote_addr: Option<String>,

    /// Address `tollgate store` listens on
    #[serde(default = "default_store_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Seconds without refill after which `tollgate store` drops a key, 0 to keep forever
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            remote_addr: None,
            listen_addr: default_store_listen_addr(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

fn default_store_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8091))
}

fn default_idle_ttl() -> u64 {
    3600
}

impl StoreConfig {
    /// The idle eviction threshold, if enabled.
    pub fn idle_ttl(&self) -> Option<Duration> {
        (self.idle_ttl_secs > 0).then(|| Duration::from_secs(self.idle_ttl_secs))
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TOLLGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Yaml,
            ));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.limiter
            .policy()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        if self.limiter.cost_per_request <= 0 {
            return Err(TollgateError::Config(format!(
                "limiter.cost_per_request must be positive, got {}",
                self.limiter.cost_per_request
            )));
        }

        if self.store.kind == StoreKind::Remote && self.store.remote_addr.is_none() {
            return Err(TollgateError::Config(
                "store.remote_addr is required when store.kind is remote".to_string(),
            ));
        }

        Ok(())
    }
}
