//! Fallback Policy Engine
//!
//! Chooses and orders candidate providers per model and drives retries
//! across them through each provider's circuit breaker. Retrying across
//! *providers* lives here; retrying against the *same* provider is the
//! adapter's job, and a provider whose breaker just opened is never
//! re-invoked within the same request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::provider::{HealthStatus, Provider, SharedDirectory};
use crate::routing::breaker::BreakerRegistry;

// ============================================================================
// Configuration
// ============================================================================

/// Candidate ordering strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Natural discovery order
    #[default]
    None,
    /// Rotate candidates with a per-model cursor that advances every call
    RoundRobin,
    /// Ascending configured priority number; unset priority is tried last
    Priority,
    /// Fisher–Yates shuffle per call
    Random,
    /// Healthy providers first, ties broken by most recently checked
    HealthBased,
}

/// Per-model fallback configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Ordering strategy
    #[serde(default)]
    pub strategy: FallbackStrategy,
    /// Pinned provider order; when set, candidates are filtered and ordered
    /// to exactly this list
    #[serde(default)]
    pub provider_order: Option<Vec<String>>,
    /// Upper bound on providers attempted (further bounded by candidates)
    pub max_attempts: usize,
    /// Whether fallback is active for the model
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Optional delay between failed attempts
    #[serde(default)]
    pub attempt_delay: Option<Duration>,
}

fn default_enabled() -> bool {
    true
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategy: FallbackStrategy::None,
            provider_order: None,
            max_attempts: 3,
            enabled: true,
            attempt_delay: None,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Strategy-ordered cross-provider retry engine
pub struct FallbackEngine {
    directory: SharedDirectory,
    breakers: Arc<BreakerRegistry>,
    configs: RwLock<HashMap<String, FallbackConfig>>,
    cursors: DashMap<String, AtomicUsize>,
}

impl FallbackEngine {
    /// Create an engine over a directory and breaker registry
    #[must_use]
    pub fn new(directory: SharedDirectory, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            directory,
            breakers,
            configs: RwLock::new(HashMap::new()),
            cursors: DashMap::new(),
        }
    }

    /// Set (or replace) a model's fallback configuration
    pub fn set_config(&self, model: impl Into<String>, config: FallbackConfig) {
        self.configs.write().insert(model.into(), config);
    }

    /// A model's current fallback configuration, if any
    #[must_use]
    pub fn config(&self, model: &str) -> Option<FallbackConfig> {
        self.configs.read().get(model).cloned()
    }

    /// Remove a model's fallback configuration
    pub fn remove_config(&self, model: &str) -> bool {
        self.configs.write().remove(model).is_some()
    }

    /// Execute `request_fn` against candidate providers for a model.
    ///
    /// With no (or disabled) fallback configuration, the single best
    /// provider runs once through its breaker. Otherwise candidates are
    /// filtered by breaker state, ordered by the configured strategy, and
    /// attempted in order up to `min(max_attempts, candidates)`; the first
    /// success wins. Exhaustion raises one aggregated
    /// [`GatewayError::FallbackExhausted`].
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        model: &str,
        request_fn: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(Provider) -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let candidates = self.directory.providers_for_model(model).await;
        if candidates.is_empty() {
            return Err(GatewayError::ModelNotFound(model.to_string()));
        }

        let config = self.config(model);
        let Some(config) = config.filter(|c| c.enabled) else {
            let provider = Self::best_single(&candidates, &self.breakers);
            let breaker = self.breakers.breaker(&provider.id);
            return breaker.execute(|| request_fn(provider.clone())).await;
        };

        let ordered = self.order_candidates(model, candidates, &config);
        if ordered.is_empty() {
            // Every candidate's breaker is open; reject without touching
            // any adapter.
            let all = self.directory.providers_for_model(model).await;
            let last = all
                .first()
                .map(|p| {
                    let snapshot = self.breakers.breaker(&p.id).snapshot();
                    GatewayError::BreakerOpen {
                        provider: p.id.clone(),
                        retry_after: snapshot.retry_after.unwrap_or_default(),
                    }
                })
                .unwrap_or_else(|| GatewayError::ModelNotFound(model.to_string()));
            return Err(GatewayError::FallbackExhausted {
                model: model.to_string(),
                attempts: 0,
                last: Box::new(last),
            });
        }

        let attempts = config.max_attempts.max(1).min(ordered.len());
        let mut last_error: Option<GatewayError> = None;

        for (attempt, provider) in ordered.into_iter().take(attempts).enumerate() {
            if attempt > 0 {
                if let Some(delay) = config.attempt_delay {
                    tokio::time::sleep(delay).await;
                }
            }
            let breaker = self.breakers.breaker(&provider.id);
            debug!(
                model,
                provider = %provider.id,
                attempt = attempt + 1,
                "fallback attempt"
            );
            match breaker.execute(|| request_fn(provider.clone())).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(model, provider = %provider.id, error = %err, "attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(GatewayError::FallbackExhausted {
            model: model.to_string(),
            attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| GatewayError::Internal("no attempts ran".to_string())),
            ),
        })
    }

    /// Filter breaker-open candidates and apply the configured ordering
    fn order_candidates(
        &self,
        model: &str,
        candidates: Vec<Provider>,
        config: &FallbackConfig,
    ) -> Vec<Provider> {
        let mut available: Vec<Provider> = candidates
            .into_iter()
            .filter(|p| !self.breakers.is_open(&p.id))
            .collect();

        if let Some(order) = &config.provider_order {
            // Pinned order wins over any strategy
            let mut pinned = Vec::with_capacity(order.len());
            for id in order {
                if let Some(pos) = available.iter().position(|p| &p.id == id) {
                    pinned.push(available.swap_remove(pos));
                }
            }
            return pinned;
        }

        match config.strategy {
            FallbackStrategy::None => {}
            FallbackStrategy::Priority => {
                available.sort_by_key(|p| p.priority.unwrap_or(u32::MAX));
            }
            FallbackStrategy::RoundRobin => {
                // The cursor advances on every call, even when the rotation
                // is a no-op for short candidate lists.
                let cursor = self
                    .cursors
                    .entry(model.to_string())
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
                let len = available.len();
                if len > 0 {
                    available.rotate_left(cursor % len);
                }
            }
            FallbackStrategy::Random => {
                available.shuffle(&mut rand::thread_rng());
            }
            FallbackStrategy::HealthBased => {
                available.sort_by(|a, b| {
                    let healthy = |p: &Provider| p.health.status == HealthStatus::Healthy;
                    healthy(b)
                        .cmp(&healthy(a))
                        .then(b.health.last_checked_ms.cmp(&a.health.last_checked_ms))
                });
            }
        }
        available
    }

    /// Single-provider resolution for models without fallback: healthy
    /// providers preferred, then ascending priority
    fn best_single(candidates: &[Provider], breakers: &BreakerRegistry) -> Provider {
        candidates
            .iter()
            .filter(|p| !breakers.is_open(&p.id))
            .min_by_key(|p| {
                let unhealthy = p.health.status != HealthStatus::Healthy;
                (unhealthy, p.priority.unwrap_or(u32::MAX))
            })
            .unwrap_or(&candidates[0])
            .clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        AdapterSettings, InMemoryDirectory, ProviderHealth,
    };
    use crate::routing::breaker::BreakerConfig;
    use std::sync::atomic::AtomicU32;

    fn provider(id: &str, model: &str, priority: Option<u32>) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            settings: AdapterSettings::Local {
                base_url: "http://localhost:11434".to_string(),
                family: None,
                default_tag: None,
                timeout: None,
            },
            credential_ref: None,
            models: vec![crate::provider::ModelMapping {
                public_id: model.to_string(),
                provider_id: model.to_string(),
                max_tokens: None,
                context_window: None,
                supports_embeddings: false,
                supports_streaming: true,
            }],
            enabled: true,
            priority,
            health: ProviderHealth::default(),
        }
    }

    fn engine(providers: Vec<Provider>) -> FallbackEngine {
        let directory = Arc::new(InMemoryDirectory::new(providers)) as SharedDirectory;
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(60),
        }));
        FallbackEngine::new(directory, breakers)
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let engine = engine(vec![]);
        let result = engine
            .execute_with_fallback("ghost", |_| async { Ok::<_, GatewayError>(()) })
            .await;
        assert!(matches!(result, Err(GatewayError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn test_priority_strategy_order() {
        let engine = engine(vec![
            provider("x", "m", Some(2)),
            provider("y", "m", Some(1)),
        ]);
        engine.set_config(
            "m",
            FallbackConfig {
                strategy: FallbackStrategy::Priority,
                max_attempts: 2,
                ..Default::default()
            },
        );

        let tried = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&tried);
        let result = engine
            .execute_with_fallback("m", move |p| {
                let record = Arc::clone(&record);
                async move {
                    record.lock().push(p.id.clone());
                    Ok::<_, GatewayError>(p.id)
                }
            })
            .await;

        // Y (priority 1) is tried before X (priority 2)
        assert_eq!(result.unwrap(), "y");
        assert_eq!(*tried.lock(), vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn test_priority_unset_tried_last() {
        let engine = engine(vec![
            provider("unset", "m", None),
            provider("low", "m", Some(5)),
        ]);
        engine.set_config(
            "m",
            FallbackConfig {
                strategy: FallbackStrategy::Priority,
                max_attempts: 2,
                ..Default::default()
            },
        );

        let tried = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&tried);
        let _ = engine
            .execute_with_fallback("m", move |p| {
                let record = Arc::clone(&record);
                async move {
                    record.lock().push(p.id.clone());
                    Err::<(), _>(GatewayError::Connection("down".into()))
                }
            })
            .await;

        assert_eq!(*tried.lock(), vec!["low".to_string(), "unset".to_string()]);
    }

    #[tokio::test]
    async fn test_failover_to_second_provider() {
        let engine = engine(vec![
            provider("bad", "m", Some(1)),
            provider("good", "m", Some(2)),
        ]);
        engine.set_config(
            "m",
            FallbackConfig {
                strategy: FallbackStrategy::Priority,
                max_attempts: 3,
                ..Default::default()
            },
        );

        let result = engine
            .execute_with_fallback("m", |p| async move {
                if p.id == "bad" {
                    Err(GatewayError::Connection("refused".into()))
                } else {
                    Ok(p.id)
                }
            })
            .await;
        assert_eq!(result.unwrap(), "good");
    }

    #[tokio::test]
    async fn test_exhaustion_aggregates_attempts() {
        let engine = engine(vec![
            provider("a", "m", Some(1)),
            provider("b", "m", Some(2)),
            provider("c", "m", Some(3)),
        ]);
        engine.set_config(
            "m",
            FallbackConfig {
                strategy: FallbackStrategy::Priority,
                max_attempts: 2,
                ..Default::default()
            },
        );

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = engine
            .execute_with_fallback("m", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(GatewayError::Connection("down".into()))
                }
            })
            .await;

        // max_attempts bounds the candidate count
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match result {
            Err(GatewayError::FallbackExhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, GatewayError::Connection(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_breakers_open_zero_adapter_calls() {
        let engine = engine(vec![provider("a", "m", None), provider("b", "m", None)]);
        engine.set_config("m", FallbackConfig::default());
        engine.breakers.breaker("a").force_open();
        engine.breakers.breaker("b").force_open();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = engine
            .execute_with_fallback("m", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GatewayError>(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match result {
            Err(GatewayError::FallbackExhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 0);
                assert!(matches!(*last, GatewayError::BreakerOpen { .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pinned_order_wins() {
        let engine = engine(vec![
            provider("a", "m", Some(1)),
            provider("b", "m", Some(2)),
            provider("c", "m", Some(3)),
        ]);
        engine.set_config(
            "m",
            FallbackConfig {
                strategy: FallbackStrategy::Priority,
                provider_order: Some(vec!["c".to_string(), "a".to_string()]),
                max_attempts: 5,
                ..Default::default()
            },
        );

        let tried = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&tried);
        let _ = engine
            .execute_with_fallback("m", move |p| {
                let record = Arc::clone(&record);
                async move {
                    record.lock().push(p.id.clone());
                    Err::<(), _>(GatewayError::Connection("down".into()))
                }
            })
            .await;

        // Exactly the pinned providers, in pinned order; "b" is skipped
        assert_eq!(*tried.lock(), vec!["c".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_round_robin_cursor_advances() {
        let engine = engine(vec![
            provider("a", "m", None),
            provider("b", "m", None),
        ]);
        engine.set_config(
            "m",
            FallbackConfig {
                strategy: FallbackStrategy::RoundRobin,
                max_attempts: 1,
                ..Default::default()
            },
        );

        let mut firsts = Vec::new();
        for _ in 0..4 {
            let first = engine
                .execute_with_fallback("m", |p| async move { Ok::<_, GatewayError>(p.id) })
                .await
                .unwrap();
            firsts.push(first);
        }
        // Rotation alternates between the two candidates
        assert_ne!(firsts[0], firsts[1]);
        assert_eq!(firsts[0], firsts[2]);
        assert_eq!(firsts[1], firsts[3]);
    }

    #[tokio::test]
    async fn test_health_based_ordering() {
        let mut healthy_recent = provider("recent", "m", None);
        healthy_recent.health = ProviderHealth {
            status: HealthStatus::Healthy,
            last_checked_ms: 2_000,
            last_error: None,
        };
        let mut healthy_stale = provider("stale", "m", None);
        healthy_stale.health = ProviderHealth {
            status: HealthStatus::Healthy,
            last_checked_ms: 1_000,
            last_error: None,
        };
        let unhealthy = provider("down", "m", None);

        let engine = engine(vec![unhealthy, healthy_stale, healthy_recent]);
        engine.set_config(
            "m",
            FallbackConfig {
                strategy: FallbackStrategy::HealthBased,
                max_attempts: 3,
                ..Default::default()
            },
        );

        let tried = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&tried);
        let _ = engine
            .execute_with_fallback("m", move |p| {
                let record = Arc::clone(&record);
                async move {
                    record.lock().push(p.id.clone());
                    Err::<(), _>(GatewayError::Connection("down".into()))
                }
            })
            .await;

        assert_eq!(
            *tried.lock(),
            vec!["recent".to_string(), "stale".to_string(), "down".to_string()]
        );
    }

    #[tokio::test]
    async fn test_disabled_config_runs_single_best() {
        let engine = engine(vec![
            provider("a", "m", Some(2)),
            provider("b", "m", Some(1)),
        ]);
        engine.set_config(
            "m",
            FallbackConfig {
                enabled: false,
                ..Default::default()
            },
        );

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = engine
            .execute_with_fallback("m", move |p| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GatewayError>(p.id)
                }
            })
            .await;

        assert_eq!(result.unwrap(), "b");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
