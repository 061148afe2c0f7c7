//! Outbound Connection Pool
//!
//! Per-origin pooled HTTP clients for every network transport. Clients are
//! created lazily per `scheme://host:port` origin and reused by all
//! providers targeting that origin, so keep-alive connections are shared.
//! Lease accounting feeds the performance facade's pool-utilization signal.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::error::GatewayError;

// ============================================================================
// Configuration
// ============================================================================

/// Pool tuning applied to every pooled client
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Maximum idle keep-alive connections per host
    pub max_idle_per_host: usize,
    /// How long idle connections are kept alive
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 8,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time pool statistics
#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    /// Distinct origins with a pooled client
    pub origins: usize,
    /// Requests currently holding a lease
    pub active_leases: usize,
    /// Total leases handed out
    pub total_leases: u64,
}

impl PoolStats {
    /// Active leases relative to the pool's nominal connection budget
    /// (`origins * max_idle_per_host`), clamped to 1.0. An approximation:
    /// the underlying client may open more connections under burst.
    #[must_use]
    pub fn utilization(&self, max_idle_per_host: usize) -> f64 {
        let budget = self.origins.max(1) * max_idle_per_host.max(1);
        (self.active_leases as f64 / budget as f64).min(1.0)
    }
}

// ============================================================================
// Pool Manager
// ============================================================================

struct Counters {
    active_leases: AtomicUsize,
    total_leases: AtomicU64,
}

/// Lazily built, per-origin pooled HTTP clients
pub struct PoolManager {
    config: PoolConfig,
    clients: DashMap<String, reqwest::Client>,
    counters: Arc<Counters>,
}

impl PoolManager {
    /// Create an empty pool
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            counters: Arc::new(Counters {
                active_leases: AtomicUsize::new(0),
                total_leases: AtomicU64::new(0),
            }),
        }
    }

    /// Lease the pooled client for a base URL's origin.
    ///
    /// The lease is an RAII guard; dropping it releases the utilization
    /// accounting (the underlying connections stay pooled in the client).
    pub fn lease(&self, base_url: &str) -> Result<PoolLease, GatewayError> {
        let origin = origin_of(base_url)?;
        let client = match self.clients.get(&origin) {
            Some(client) => client.clone(),
            None => {
                let client = self.build_client()?;
                debug!(origin = %origin, "created pooled client");
                self.clients.entry(origin).or_insert(client).clone()
            }
        };

        self.counters.active_leases.fetch_add(1, Ordering::Relaxed);
        self.counters.total_leases.fetch_add(1, Ordering::Relaxed);
        Ok(PoolLease {
            client,
            counters: Arc::clone(&self.counters),
        })
    }

    fn build_client(&self) -> Result<reqwest::Client, GatewayError> {
        reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .pool_idle_timeout(self.config.idle_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
    }

    /// Drop the pooled client for an origin, closing its idle connections
    pub fn evict(&self, base_url: &str) -> bool {
        origin_of(base_url)
            .ok()
            .and_then(|origin| self.clients.remove(&origin))
            .is_some()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            origins: self.clients.len(),
            active_leases: self.counters.active_leases.load(Ordering::Relaxed),
            total_leases: self.counters.total_leases.load(Ordering::Relaxed),
        }
    }

    /// Utilization for the facade's composite health
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.stats().utilization(self.config.max_idle_per_host)
    }
}

/// RAII lease over a pooled client
pub struct PoolLease {
    client: reqwest::Client,
    counters: Arc<Counters>,
}

impl PoolLease {
    /// The pooled client
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.counters.active_leases.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Reduce a base URL to its `scheme://host:port` origin
fn origin_of(base_url: &str) -> Result<String, GatewayError> {
    let url: reqwest::Url = base_url.parse().map_err(|e| GatewayError::Configuration {
        provider: None,
        message: format!("invalid base URL '{base_url}': {e}"),
    })?;
    let host = url.host_str().ok_or_else(|| GatewayError::Configuration {
        provider: None,
        message: format!("base URL '{base_url}' has no host"),
    })?;
    match url.port_or_known_default() {
        Some(port) => Ok(format!("{}://{host}:{port}", url.scheme())),
        None => Ok(format!("{}://{host}", url.scheme())),
    }
}

// ============================================================================
// Tests
// ============================================================================
