//! Health Monitor
//!
//! Background prober that exercises every enabled provider on a fixed
//! interval and feeds the circuit breaker registry. A successful probe
//! writes `healthy` to the provider record and resets the provider's
//! breaker — the recovery signal independent of traffic. A failed probe
//! writes `unhealthy` and leaves the breaker untouched; only traffic
//! failures open it.
//!
//! Concurrent checks of the same provider are de-duplicated: a second
//! caller awaits the in-flight check's shared future instead of issuing a
//! second probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::AdapterCache;
use crate::events::{EventSink, GatewayEvent, NullSink};
use crate::provider::{HealthStatus, Provider, ProviderHealth, SharedDirectory};
use crate::routing::breaker::BreakerRegistry;

// ============================================================================
// Configuration & Results
// ============================================================================

/// Monitor tuning
#[derive(Clone, Copy, Debug)]
pub struct HealthMonitorConfig {
    /// Probe cycle interval
    pub interval: Duration,
    /// Timeout applied to each probe
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one provider probe
#[derive(Clone, Debug)]
pub struct HealthCheckResult {
    /// Provider that was probed
    pub provider: String,
    /// Whether the probe succeeded
    pub healthy: bool,
    /// Probe duration
    pub duration: Duration,
    /// Error message on failure
    pub error: Option<String>,
}

/// Rolling monitor statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct HealthMonitorStats {
    /// Completed probe cycles
    pub cycles: u64,
    /// Exponential moving average of cycle duration, in milliseconds
    pub avg_cycle_ms: f64,
    /// Providers checked in the last cycle
    pub last_cycle_providers: usize,
}

type SharedCheck = Shared<BoxFuture<'static, HealthCheckResult>>;

// ============================================================================
// Health Monitor
// ============================================================================

/// Background prober over the provider directory
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    directory: SharedDirectory,
    breakers: Arc<BreakerRegistry>,
    adapters: Arc<AdapterCache>,
    in_flight: Arc<DashMap<String, SharedCheck>>,
    stats: Arc<Mutex<HealthMonitorStats>>,
    events: Arc<dyn EventSink>,
}

impl HealthMonitor {
    /// Create a monitor over a directory, breaker registry, and adapter cache
    #[must_use]
    pub fn new(
        config: HealthMonitorConfig,
        directory: SharedDirectory,
        breakers: Arc<BreakerRegistry>,
        adapters: Arc<AdapterCache>,
    ) -> Self {
        Self::with_events(config, directory, breakers, adapters, Arc::new(NullSink))
    }

    /// Create a monitor that emits check events
    #[must_use]
    pub fn with_events(
        config: HealthMonitorConfig,
        directory: SharedDirectory,
        breakers: Arc<BreakerRegistry>,
        adapters: Arc<AdapterCache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            directory,
            breakers,
            adapters,
            in_flight: Arc::new(DashMap::new()),
            stats: Arc::new(Mutex::new(HealthMonitorStats::default())),
            events,
        }
    }

    /// Spawn the interval prober; runs until the handle is aborted
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.interval;
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_all().await;
            }
        })
    }

    /// Probe every enabled provider once; manual entry point for operators
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let started = Instant::now();
        let providers = self.directory.enabled_providers().await;
        let count = providers.len();

        let results = futures::future::join_all(
            providers.into_iter().map(|p| self.check_provider(p)),
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as f64;
        {
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.avg_cycle_ms = if stats.cycles == 1 {
                elapsed_ms
            } else {
                stats.avg_cycle_ms * 0.8 + elapsed_ms * 0.2
            };
            stats.last_cycle_providers = count;
        }
        debug!(providers = count, elapsed_ms, "health cycle complete");
        results
    }

    /// Probe one provider by id; manual entry point for operators
    pub async fn check(&self, provider_id: &str) -> Option<HealthCheckResult> {
        let provider = self.directory.provider(provider_id).await?;
        Some(self.check_provider(provider).await)
    }

    /// Probe one provider, reusing an in-flight check for the same identity
    pub async fn check_provider(&self, provider: Provider) -> HealthCheckResult {
        let id = provider.id.clone();
        // entry() makes insertion atomic: concurrent callers for the same
        // provider all clone the same shared future.
        let check = self
            .in_flight
            .entry(id.clone())
            .or_insert_with(|| self.build_check(provider).boxed().shared())
            .clone();
        let result = check.await;
        self.in_flight.remove(&id);
        result
    }

    fn build_check(
        &self,
        provider: Provider,
    ) -> impl std::future::Future<Output = HealthCheckResult> + Send + 'static {
        let directory = Arc::clone(&self.directory);
        let breakers = Arc::clone(&self.breakers);
        let adapters = Arc::clone(&self.adapters);
        let events = Arc::clone(&self.events);
        let probe_timeout = self.config.probe_timeout;

        async move {
            let id = provider.id.clone();
            let started = Instant::now();

            let probe = async {
                let adapter = adapters.get_or_build(&provider)?;
                adapter.test_connection().await
            };
            let outcome = match tokio::time::timeout(probe_timeout, probe).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "health probe timed out after {}ms",
                    probe_timeout.as_millis()
                )),
            };
            let duration = started.elapsed();

            let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
            let (status, error) = match &outcome {
                Ok(()) => (HealthStatus::Healthy, None),
                Err(e) => (HealthStatus::Unhealthy, Some(e.clone())),
            };
            directory
                .set_health(
                    &id,
                    ProviderHealth {
                        status,
                        last_checked_ms: now_ms,
                        last_error: error.clone(),
                    },
                )
                .await;

            match &outcome {
                Ok(()) => {
                    // Traffic-independent recovery: a passing probe closes
                    // the breaker even if no request has succeeded yet.
                    breakers.breaker(&id).force_reset();
                    debug!(provider = %id, duration_ms = duration.as_millis() as u64, "probe ok");
                }
                Err(e) => {
                    // Probe failures do not open the breaker; only traffic
                    // failures do.
                    warn!(provider = %id, error = %e, "probe failed");
                }
            }

            events.emit(GatewayEvent::HealthCheck {
                provider: id.clone(),
                status,
                duration_ms: duration.as_millis() as u64,
                error: error.clone(),
            });

            HealthCheckResult {
                provider: id,
                healthy: outcome.is_ok(),
                duration,
                error,
            }
        }
    }

    /// Rolling statistics
    #[must_use]
    pub fn stats(&self) -> HealthMonitorStats {
        *self.stats.lock()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        AdapterSettings, InMemoryDirectory, ProviderDirectory, StaticCredentials,
    };
    use crate::routing::breaker::{BreakerConfig, BreakerState};
    use crate::routing::pool::{PoolConfig, PoolManager};
    use std::collections::HashMap;

    fn sandbox_provider(id: &str, command: &str) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            settings: AdapterSettings::Sandbox {
                command: command.to_string(),
                args: Vec::new(),
                image: None,
                memory_limit_mb: None,
                timeout: None,
                streaming: false,
            },
            credential_ref: None,
            models: Vec::new(),
            enabled: true,
            priority: None,
            health: ProviderHealth::default(),
        }
    }

    fn monitor_over(providers: Vec<Provider>) -> (Arc<HealthMonitor>, Arc<InMemoryDirectory>) {
        let directory = Arc::new(InMemoryDirectory::new(providers));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let adapters = Arc::new(AdapterCache::new(
            Arc::new(StaticCredentials::new(HashMap::new())),
            Arc::new(PoolManager::new(PoolConfig::default())),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            HealthMonitorConfig {
                interval: Duration::from_secs(30),
                probe_timeout: Duration::from_secs(2),
            },
            directory.clone() as SharedDirectory,
            breakers,
            adapters,
        ));
        (monitor, directory)
    }

    #[tokio::test]
    async fn test_sandbox_probe_is_config_validation() {
        // Sandbox health checks validate configuration only; no process
        // runs, so a nonexistent-but-configured command passes while an
        // empty command fails.
        let (monitor, directory) = monitor_over(vec![
            sandbox_provider("ok", "/usr/bin/some-model-cli"),
            sandbox_provider("broken", ""),
        ]);

        let results = monitor.check_all().await;
        assert_eq!(results.len(), 2);

        let ok = directory.provider("ok").await.unwrap();
        assert_eq!(ok.health.status, HealthStatus::Healthy);
        assert!(ok.health.last_checked_ms > 0);

        let broken = directory.provider("broken").await.unwrap();
        assert_eq!(broken.health.status, HealthStatus::Unhealthy);
        assert!(broken.health.last_error.is_some());
    }

    #[tokio::test]
    async fn test_probe_success_resets_breaker() {
        let (monitor, _) = monitor_over(vec![sandbox_provider("p", "/bin/cli")]);
        let breaker = monitor.breakers.breaker("p");
        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);

        monitor.check("p").await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_breaker_closed() {
        let (monitor, _) = monitor_over(vec![sandbox_provider("p", "")]);
        let result = monitor.check("p").await.unwrap();
        assert!(!result.healthy);
        assert_eq!(monitor.breakers.breaker("p").state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_checks_deduplicated() {
        let (monitor, _) = monitor_over(vec![sandbox_provider("p", "/bin/cli")]);
        let provider = monitor.directory.provider("p").await.unwrap();

        let (a, b) = tokio::join!(
            monitor.check_provider(provider.clone()),
            monitor.check_provider(provider)
        );
        assert!(a.healthy && b.healthy);
        assert!(monitor.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_stats() {
        let (monitor, _) = monitor_over(vec![sandbox_provider("p", "/bin/cli")]);
        monitor.check_all().await;
        monitor.check_all().await;

        let stats = monitor.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.last_cycle_providers, 1);
        assert!(stats.avg_cycle_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_unknown_provider_check() {
        let (monitor, _) = monitor_over(vec![]);
        assert!(monitor.check("ghost").await.is_none());
    }
}
