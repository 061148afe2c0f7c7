//! Performance Facade
//!
//! Composes the cache engine, work queue, and connection pool behind one
//! `execute_request` entry point: cache hits short-circuit the queue
//! entirely, misses are admitted through the queue, and successful results
//! with a cache key are stored for the next caller. Rolling success rate
//! and latency percentiles feed a composite health signal.
//!
//! Values are memoized as JSON so one cache instance serves every result
//! type; a stored value that no longer deserializes is treated as a miss.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::GatewayError;
use crate::routing::cache::TtlCache;
use crate::routing::pool::PoolManager;
use crate::routing::queue::WorkQueue;

// Rolling sample window for latency/success statistics
const SAMPLE_WINDOW: usize = 256;
// Samples required before success rate counts against health
const MIN_SAMPLES: usize = 20;

// ============================================================================
// Options & Statistics
// ============================================================================

/// Per-call execution options
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    /// Queue priority (0 = highest)
    pub priority: usize,
    /// Memoization key; `None` bypasses the cache in both directions
    pub cache_key: Option<String>,
    /// TTL override for the stored result
    pub cache_ttl: Option<Duration>,
    /// Queued-wait timeout override
    pub timeout: Option<Duration>,
}

/// Composite facade health
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FacadeHealth {
    /// Latency, success rate, and utilization are all within bounds
    Healthy,
    /// One signal is under pressure
    Degraded,
    /// Requests are mostly failing or admission is saturated
    Unhealthy,
}

/// Rolling facade statistics
#[derive(Clone, Copy, Debug)]
pub struct FacadeStats {
    /// Samples currently in the window
    pub samples: usize,
    /// Success fraction over the window, 0.0..=1.0
    pub success_rate: f64,
    /// Average latency over the window, milliseconds
    pub avg_latency_ms: f64,
    /// 95th percentile latency, milliseconds
    pub p95_latency_ms: f64,
    /// 99th percentile latency, milliseconds
    pub p99_latency_ms: f64,
    /// Cache hits observed by the facade
    pub cache_hits: u64,
    /// Cache misses observed by the facade
    pub cache_misses: u64,
}

#[derive(Clone, Copy)]
struct Sample {
    latency_ms: f64,
    ok: bool,
}

#[derive(Default)]
struct SampleWindow {
    samples: VecDeque<Sample>,
    cache_hits: u64,
    cache_misses: u64,
}

// ============================================================================
// Facade
// ============================================================================

/// Cache → queue execution facade with rolling performance statistics
pub struct PerformanceFacade {
    queue: WorkQueue,
    cache: Arc<TtlCache<serde_json::Value>>,
    pool: Arc<PoolManager>,
    window: Mutex<SampleWindow>,
}

impl PerformanceFacade {
    /// Compose a facade over the three shared structures
    #[must_use]
    pub fn new(
        queue: WorkQueue,
        cache: Arc<TtlCache<serde_json::Value>>,
        pool: Arc<PoolManager>,
    ) -> Self {
        Self {
            queue,
            cache,
            pool,
            window: Mutex::new(SampleWindow::default()),
        }
    }

    /// Execute `work` with caching and admission control.
    ///
    /// A cache hit returns without consuming a queue slot. Otherwise the
    /// work is queued at the given priority; on success with a cache key
    /// the result is stored for subsequent callers.
    pub async fn execute_request<T, F, Fut>(
        &self,
        work: F,
        options: ExecuteOptions,
    ) -> Result<T, GatewayError>
    where
        T: Clone + Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        if let Some(key) = &options.cache_key {
            if let Some(value) = self.cache.get(key) {
                if let Ok(typed) = serde_json::from_value::<T>(value) {
                    trace!(key = %key, "cache hit short-circuits queue");
                    self.window.lock().cache_hits += 1;
                    return Ok(typed);
                }
                // Stored under the same key with a different shape
                self.cache.remove(key);
            }
            self.window.lock().cache_misses += 1;
        }

        let started = Instant::now();
        let result = self
            .queue
            .submit(work, options.priority, options.timeout)
            .await;
        self.record(started.elapsed(), result.is_ok());

        if let (Ok(value), Some(key)) = (&result, options.cache_key) {
            match serde_json::to_value(value) {
                Ok(json) => {
                    let approx = json.to_string().len();
                    self.cache.set_sized(key, json, options.cache_ttl, approx);
                }
                Err(e) => trace!(error = %e, "result not cacheable"),
            }
        }
        result
    }

    fn record(&self, latency: Duration, ok: bool) {
        let mut window = self.window.lock();
        if window.samples.len() >= SAMPLE_WINDOW {
            window.samples.pop_front();
        }
        window.samples.push_back(Sample {
            latency_ms: latency.as_secs_f64() * 1_000.0,
            ok,
        });
    }

    /// Rolling statistics over the sample window
    #[must_use]
    pub fn stats(&self) -> FacadeStats {
        let window = self.window.lock();
        let n = window.samples.len();
        if n == 0 {
            return FacadeStats {
                samples: 0,
                success_rate: 1.0,
                avg_latency_ms: 0.0,
                p95_latency_ms: 0.0,
                p99_latency_ms: 0.0,
                cache_hits: window.cache_hits,
                cache_misses: window.cache_misses,
            };
        }

        let successes = window.samples.iter().filter(|s| s.ok).count();
        let mut latencies: Vec<f64> = window.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: f64| {
            let idx = ((p * n as f64).ceil() as usize).clamp(1, n) - 1;
            latencies[idx]
        };

        FacadeStats {
            samples: n,
            success_rate: successes as f64 / n as f64,
            avg_latency_ms: latencies.iter().sum::<f64>() / n as f64,
            p95_latency_ms: percentile(0.95),
            p99_latency_ms: percentile(0.99),
            cache_hits: window.cache_hits,
            cache_misses: window.cache_misses,
        }
    }

    /// Composite health from success rate, latency, queue utilization, and
    /// pool utilization. Success rate only counts once the window holds
    /// enough samples.
    #[must_use]
    pub fn health(&self) -> FacadeHealth {
        let stats = self.stats();
        let queue = self.queue.stats();
        let queue_util = queue.queue_utilization();
        let pool_util = self.pool.utilization();
        let warmed_up = stats.samples >= MIN_SAMPLES;

        if (warmed_up && stats.success_rate < 0.5) || queue_util >= 1.0 {
            FacadeHealth::Unhealthy
        } else if (warmed_up && stats.success_rate < 0.9)
            || queue_util > 0.8
            || pool_util > 0.9
            || stats.p95_latency_ms > 30_000.0
        {
            FacadeHealth::Degraded
        } else {
            FacadeHealth::Healthy
        }
    }

    /// The composed queue, for utilization reporting
    #[must_use]
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// The composed cache
    #[must_use]
    pub fn cache(&self) -> &Arc<TtlCache<serde_json::Value>> {
        &self.cache
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::cache::CacheConfig;
    use crate::routing::pool::PoolConfig;
    use crate::routing::queue::QueueConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn facade() -> PerformanceFacade {
        PerformanceFacade::new(
            WorkQueue::new(QueueConfig::default()),
            Arc::new(TtlCache::new(CacheConfig::default())),
            Arc::new(PoolManager::new(PoolConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_cache_hit_skips_work() {
        let f = facade();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&calls);
            let result: String = f
                .execute_request(
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok("expensive".to_string())
                    },
                    ExecuteOptions {
                        cache_key: Some("k".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(result, "expensive");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = f.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_no_cache_key_always_executes() {
        let f = facade();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&calls);
            let _: u32 = f
                .execute_request(
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    },
                    ExecuteOptions::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let f = facade();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&calls);
            let result: Result<u32, _> = f
                .execute_request(
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(GatewayError::Connection("down".into()))
                    },
                    ExecuteOptions {
                        cache_key: Some("k".to_string()),
                        ..Default::default()
                    },
                )
                .await;
            assert!(result.is_err());
        }
        // The failed result was never stored, so the work ran twice
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stats_track_success_and_latency() {
        let f = facade();
        for i in 0..10u32 {
            let _: Result<u32, _> = f
                .execute_request(
                    move || async move {
                        if i < 8 {
                            Ok(i)
                        } else {
                            Err(GatewayError::Connection("down".into()))
                        }
                    },
                    ExecuteOptions::default(),
                )
                .await;
        }

        let stats = f.stats();
        assert_eq!(stats.samples, 10);
        assert!((stats.success_rate - 0.8).abs() < 1e-9);
        assert!(stats.p95_latency_ms >= stats.avg_latency_ms * 0.1);
        assert!(stats.p99_latency_ms >= stats.p95_latency_ms);
    }

    #[tokio::test]
    async fn test_health_degrades_on_failures() {
        let f = facade();
        assert_eq!(f.health(), FacadeHealth::Healthy);

        for _ in 0..MIN_SAMPLES {
            let _: Result<u32, _> = f
                .execute_request(
                    || async { Err(GatewayError::Connection("down".into())) },
                    ExecuteOptions::default(),
                )
                .await;
        }
        assert_eq!(f.health(), FacadeHealth::Unhealthy);
    }

    #[tokio::test]
    async fn test_cache_ttl_override() {
        let f = facade();
        let _: u32 = f
            .execute_request(
                || async { Ok(1) },
                ExecuteOptions {
                    cache_key: Some("k".to_string()),
                    cache_ttl: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let _: u32 = f
            .execute_request(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                },
                ExecuteOptions {
                    cache_key: Some("k".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
