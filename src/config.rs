//! Gateway Configuration
//!
//! TOML-backed configuration for the daemon: provider records, component
//! tuning knobs (breaker, queue, cache, health, pool), and credential
//! references. Loaded from an explicit path or the XDG default location.
//!
//! Durations in the file are plain millisecond integers (`*_ms`) and are
//! converted to `Duration` at the component boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::Provider;
use crate::routing::breaker::BreakerConfig;
use crate::routing::cache::CacheConfig;
use crate::routing::health::HealthMonitorConfig;
use crate::routing::pool::PoolConfig;
use crate::routing::queue::QueueConfig;

// ============================================================================
// Config Error
// ============================================================================

/// Errors from loading or validating the gateway configuration
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read
    Io(std::io::Error),
    /// The config file is not valid TOML
    Parse(toml::de::Error),
    /// The config parsed but is semantically invalid
    Invalid(String),
    /// No config path was given and no default location exists
    NoDefaultPath,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Failed to read config file: {e}"),
            Self::Parse(e) => write!(f, "Failed to parse config file: {e}"),
            Self::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::NoDefaultPath => write!(f, "No config path given and no default location found"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

// ============================================================================
// File Schema
// ============================================================================

/// Top-level gateway configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Configured providers
    #[serde(default)]
    pub providers: Vec<Provider>,

    /// Credential reference name → secret. Intended for local development;
    /// production deployments resolve references through an external store.
    #[serde(default)]
    pub credentials: HashMap<String, String>,

    /// Circuit breaker tuning
    #[serde(default)]
    pub breaker: BreakerSection,

    /// Work queue tuning
    #[serde(default)]
    pub queue: QueueSection,

    /// Response/lookup cache tuning
    #[serde(default)]
    pub cache: CacheSection,

    /// Health monitor tuning
    #[serde(default)]
    pub health: HealthSection,

    /// Outbound connection pool tuning
    #[serde(default)]
    pub pool: PoolSection,
}

/// `[breaker]` section
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Per-call execution timeout in milliseconds
    pub timeout_ms: u64,
    /// Time the breaker stays open before allowing a probe, in milliseconds
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 30_000,
            reset_timeout_ms: 60_000,
        }
    }
}

impl BreakerSection {
    /// Convert to the component config
    #[must_use]
    pub fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout: Duration::from_millis(self.timeout_ms),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }
}

/// `[queue]` section
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSection {
    /// Number of priority levels
    pub levels: usize,
    /// Maximum queued items across all levels
    pub max_queued: usize,
    /// Maximum concurrently executing items
    pub max_concurrent: usize,
    /// Default queued-wait timeout in milliseconds
    pub default_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            levels: 3,
            max_queued: 200,
            max_concurrent: 16,
            default_timeout_ms: 30_000,
        }
    }
}

impl QueueSection {
    /// Convert to the component config
    #[must_use]
    pub fn to_config(&self) -> QueueConfig {
        QueueConfig {
            levels: self.levels,
            max_queued: self.max_queued,
            max_concurrent: self.max_concurrent,
            default_timeout: Duration::from_millis(self.default_timeout_ms),
        }
    }
}

/// `[cache]` section
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheSection {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Default per-entry TTL in milliseconds
    pub default_ttl_ms: u64,
    /// Sweep interval for expired entries in milliseconds
    pub sweep_interval_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            default_ttl_ms: 300_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl CacheSection {
    /// Convert to the component config
    #[must_use]
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            default_ttl: Duration::from_millis(self.default_ttl_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}

/// `[health]` section
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSection {
    /// Probe cycle interval in milliseconds
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            probe_timeout_ms: 10_000,
        }
    }
}

impl HealthSection {
    /// Convert to the component config
    #[must_use]
    pub fn to_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval: Duration::from_millis(self.interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

/// `[pool]` section
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSection {
    /// Maximum idle connections kept per host
    pub max_idle_per_host: usize,
    /// Idle connection keep-alive in milliseconds
    pub idle_timeout_ms: u64,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_idle_per_host: 8,
            idle_timeout_ms: 90_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl PoolSection {
    /// Convert to the component config
    #[must_use]
    pub fn to_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.max_idle_per_host,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Default config path: `$XDG_CONFIG_HOME/gateway/gateway.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("gateway").join("gateway.toml"))
}

/// Load and validate configuration from a file
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: GatewayConfig = toml::from_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

/// Load from an explicit path, or fall back to the default location
pub fn load_config_or_default(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    match path {
        Some(p) => load_config(p),
        None => {
            let default = default_config_path().ok_or(ConfigError::NoDefaultPath)?;
            if default.exists() {
                load_config(&default)
            } else {
                Ok(GatewayConfig::default())
            }
        }
    }
}

fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for provider in &config.providers {
        if provider.id.is_empty() {
            return Err(ConfigError::Invalid("provider with empty id".to_string()));
        }
        if !seen.insert(provider.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate provider id '{}'",
                provider.id
            )));
        }
        if let Some(name) = &provider.credential_ref {
            if !config.credentials.contains_key(name)
                && std::env::var(format!("GATEWAY_CREDENTIAL_{}", name.to_uppercase())).is_err()
            {
                tracing::warn!(
                    provider = %provider.id,
                    credential = %name,
                    "credential reference has no local value; expecting external resolver"
                );
            }
        }
    }
    if config.queue.levels == 0 {
        return Err(ConfigError::Invalid(
            "queue.levels must be at least 1".to_string(),
        ));
    }
    if config.queue.max_concurrent == 0 {
        return Err(ConfigError::Invalid(
            "queue.max_concurrent must be at least 1".to_string(),
        ));
    }
    if config.cache.max_entries == 0 {
        return Err(ConfigError::Invalid(
            "cache.max_entries must be at least 1".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
