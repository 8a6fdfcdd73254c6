//! Configuration management for the limiter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LimiterError, Result};
use crate::store::redis::DEFAULT_KEY_PREFIX;

/// Prefix of environment variables overriding file configuration,
/// e.g. `HIVEMIND__STORE__TIMEOUT_MS=25`.
pub const ENV_PREFIX: &str = "HIVEMIND";

/// Main configuration for a limiter instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Store health tracking
    #[serde(default)]
    pub health: HealthConfig,

    /// Local fallback cache
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Path to the policy definitions file
    #[serde(default)]
    pub policies_path: Option<String>,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; limits are not shared between instances
    #[default]
    Memory,
    /// Shared Redis store
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every key the limiter writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for each store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Idle state is kept for this many refill or window periods
    #[serde(default = "default_ttl_safety_factor")]
    pub ttl_safety_factor: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            ttl_safety_factor: default_ttl_safety_factor(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_ttl_safety_factor() -> u32 {
    2
}

/// Store health tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive store failures before switching to degraded mode
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,

    /// Consecutive successful probes before leaving degraded mode
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    /// Base interval between probes in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Maximum random delay added to each probe interval in milliseconds
    #[serde(default = "default_probe_jitter_ms")]
    pub probe_jitter_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: default_degraded_threshold(),
            recovery_threshold: default_recovery_threshold(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_jitter_ms: default_probe_jitter_ms(),
        }
    }
}

fn default_degraded_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_probe_jitter_ms() -> u64 {
    100
}

/// Local fallback cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Identifier of this instance; a random one is generated when unset
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Maximum number of local buckets
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Local buckets idle longer than this are swept
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            max_keys: default_max_keys(),
            idle_ttl_ms: default_idle_ttl_ms(),
        }
    }
}

fn default_max_keys() -> usize {
    10000
}

fn default_idle_ttl_ms() -> u64 {
    60_000
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply `HIVEMIND__*` environment
    /// overrides on top.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Configured instance id, or a fresh random one.
    pub fn instance_id(&self) -> String {
        self.fallback
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.health.probe_interval_ms)
    }

    /// Check cross-field requirements serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(LimiterError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        self.validate_timing()
    }

    /// Check the settings a limiter needs regardless of which store backs it.
    pub fn validate_timing(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(LimiterError::Config("store.timeout_ms must be positive".to_string()));
        }
        if self.health.probe_interval_ms == 0 {
            return Err(LimiterError::Config(
                "health.probe_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
