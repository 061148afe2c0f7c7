//! TTL + LRU Cache Engine
//!
//! Generic key/value store with per-entry TTL and least-recently-used
//! eviction, used for model lists, provider lookups, and response
//! memoization. Expired entries are evicted lazily on access and by a
//! periodic sweeper task; LRU eviction removes exactly one entry when a new
//! key is inserted at capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::events::{EventSink, GatewayEvent, NullSink};

// ============================================================================
// Configuration
// ============================================================================

/// Cache tuning
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,
    /// TTL applied when `set` is called without one
    pub default_ttl: Duration,
    /// How often the sweeper purges expired entries
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Entries & Statistics
// ============================================================================

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_access: Instant,
    hits: u64,
    approx_bytes: usize,
}

/// Point-in-time cache statistics
#[derive(Clone, Copy, Debug)]
pub struct CacheStats {
    /// Live entries (may include not-yet-swept expired entries)
    pub entries: usize,
    /// Configured capacity
    pub capacity: usize,
    /// Approximate bytes held by live entries
    pub approx_bytes: usize,
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses (including expired-on-access)
    pub misses: u64,
    /// Entries evicted under LRU pressure
    pub lru_evictions: u64,
    /// Entries removed because they expired
    pub expirations: u64,
}

impl CacheStats {
    /// Hit fraction of all lookups, 0.0..=1.0
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    /// Entry fraction of capacity, 0.0..=1.0
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.entries as f64 / self.capacity as f64
        }
    }
}

/// Derived cache health for the performance facade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheHealth {
    /// Operating normally
    Healthy,
    /// Under pressure: near capacity with a poor hit rate
    Degraded,
    /// Thrashing: at capacity and lookups mostly miss
    Unhealthy,
}

// ============================================================================
// Cache
// ============================================================================

/// Generic TTL+LRU store
pub struct TtlCache<V: Clone> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, Entry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    lru_evictions: AtomicU64,
    expirations: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl<V: Clone> TtlCache<V> {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::with_events(config, Arc::new(NullSink))
    }

    /// Create a cache that emits eviction events
    #[must_use]
    pub fn with_events(config: CacheConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lru_evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            events,
        }
    }

    /// Look up a key. Expired entries are removed and reported as misses;
    /// a hit refreshes the entry's recency.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                entry.last_access = Instant::now();
                entry.hits += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.events.emit(GatewayEvent::CacheEviction {
                    key: key.to_string(),
                    expired: true,
                });
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert with the store-wide default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, None);
    }

    /// Insert with an optional per-call TTL override.
    ///
    /// When the store is at capacity and the key is new, the single
    /// least-recently-accessed entry is evicted first.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        self.set_sized(key, value, ttl, std::mem::size_of::<V>());
    }

    /// Insert with an explicit approximate byte size for statistics
    pub fn set_sized(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        approx_bytes: usize,
    ) {
        let key = key.into();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = Instant::now();

        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let lru_key = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru_key {
                entries.remove(&lru_key);
                self.lru_evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %lru_key, "evicted LRU entry");
                self.events.emit(GatewayEvent::CacheEviction {
                    key: lru_key,
                    expired: false,
                });
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                last_access: now,
                hits: 0,
                approx_bytes,
            },
        );
    }

    /// Remove a key, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Live entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every expired entry; returns how many were purged
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.events.emit(GatewayEvent::CacheEviction {
                key: key.clone(),
                expired: true,
            });
        }
        if !expired.is_empty() {
            debug!(purged = expired.len(), "swept expired cache entries");
        }
        expired.len()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (entries, approx_bytes) = {
            let entries = self.entries.lock();
            let bytes = entries.values().map(|e| e.approx_bytes).sum();
            (entries.len(), bytes)
        };
        CacheStats {
            entries,
            capacity: self.config.max_entries,
            approx_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Health derived from utilization and hit rate.
    ///
    /// Hit rate only counts against health once the cache has seen enough
    /// lookups to be meaningful.
    #[must_use]
    pub fn health(&self) -> CacheHealth {
        let stats = self.stats();
        let lookups = stats.hits + stats.misses;
        let warmed_up = lookups >= 100;
        let full = stats.utilization() >= 0.95;

        if full && warmed_up && stats.hit_rate() < 0.1 {
            CacheHealth::Unhealthy
        } else if full || (warmed_up && stats.hit_rate() < 0.3) {
            CacheHealth::Degraded
        } else {
            CacheHealth::Healthy
        }
    }
}

/// Spawn the periodic expired-entry sweeper for a shared cache
pub fn spawn_sweeper<V: Clone + Send + 'static>(cache: Arc<TtlCache<V>>) -> JoinHandle<()> {
    let interval = cache.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            cache.purge_expired();
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
