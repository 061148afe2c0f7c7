//! Circuit Breaker
//!
//! One failure-state machine per provider identity. The breaker guards the
//! *rate* of failures, not mutual exclusion: any number of calls may run
//! concurrently while the breaker is closed.
//!
//! State machine:
//! - `closed` — requests flow; consecutive failures are counted.
//! - `open` — requests fail fast with [`GatewayError::BreakerOpen`] until
//!   `next_attempt` is reached; no provider work is attempted.
//! - `half-open` — one probe window: a success closes the breaker and zeroes
//!   the failure counter, a failure reopens it immediately and recomputes
//!   `next_attempt`.
//!
//! Breakers are created lazily on first use through [`BreakerRegistry`] and
//! live for the process lifetime; entries are removed only by the explicit
//! [`BreakerRegistry::remove`] administrative call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::events::{BreakerStateName, EventSink, GatewayEvent, NullSink};

// ============================================================================
// Configuration
// ============================================================================

/// Per-breaker tuning
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Timeout applied to each call executed through the breaker
    pub timeout: Duration,
    /// How long the breaker stays open before allowing a half-open probe
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast until `next_attempt`
    Open,
    /// One probe is allowed through
    HalfOpen,
}

impl BreakerState {
    fn name(self) -> BreakerStateName {
        match self {
            Self::Closed => BreakerStateName::Closed,
            Self::Open => BreakerStateName::Open,
            Self::HalfOpen => BreakerStateName::HalfOpen,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
}

/// Point-in-time view of a breaker, for operators and health reporting
#[derive(Clone, Debug)]
pub struct BreakerSnapshot {
    /// Provider the breaker guards
    pub provider: String,
    /// Current state
    pub state: BreakerState,
    /// Consecutive failures since the last success
    pub consecutive_failures: u32,
    /// Time until a half-open probe is allowed (open state only)
    pub retry_after: Option<Duration>,
    /// Total calls executed through the breaker
    pub total_requests: u64,
    /// Total successful calls
    pub total_successes: u64,
    /// Total failed calls
    pub total_failures: u64,
    /// Times the breaker has opened
    pub times_opened: u64,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Per-provider failure-rate guard
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    times_opened: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Create a closed breaker for a provider
    #[must_use]
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_events(provider, config, Arc::new(NullSink))
    }

    /// Create a breaker that emits transition events
    #[must_use]
    pub fn with_events(
        provider: impl Into<String>,
        config: BreakerConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                next_attempt: None,
            }),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
            events,
        }
    }

    /// Provider this breaker guards
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Current recorded state. An elapsed reset window is only observed
    /// (open becomes half-open) when a call is admitted.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call would currently fail fast.
    ///
    /// Does not consume the half-open probe window; an open breaker whose
    /// reset window has elapsed reports as available. A force-opened breaker
    /// has no scheduled attempt and reports open until
    /// [`force_reset`](Self::force_reset).
    #[must_use]
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => inner
                .next_attempt
                .map_or(true, |at| Instant::now() < at),
            _ => false,
        }
    }

    /// Run `work` under the breaker's guard and timeout.
    ///
    /// Fails fast with [`GatewayError::BreakerOpen`] when the breaker is
    /// open and the reset window has not elapsed; the rejection performs no
    /// provider work and is not counted as a provider failure.
    pub async fn execute<T, F, Fut>(&self, work: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        self.admit()?;
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.config.timeout, work()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                operation: format!("call to provider {}", self.provider),
            }),
        };

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    /// Gate a call without running it: transitions open → half-open when
    /// due, or returns the fail-fast error.
    fn admit(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            let now = Instant::now();
            match inner.next_attempt {
                Some(at) if now >= at => {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                }
                Some(at) => {
                    return Err(GatewayError::BreakerOpen {
                        provider: self.provider.clone(),
                        retry_after: at - now,
                    });
                }
                None => {
                    // Open without a scheduled attempt only happens via
                    // force_open; stay open until force_reset.
                    return Err(GatewayError::BreakerOpen {
                        provider: self.provider.clone(),
                        retry_after: self.config.reset_timeout,
                    });
                }
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            self.transition(&mut inner, BreakerState::Closed);
        }
        inner.consecutive_failures = 0;
    }

    fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());

        let should_open = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if should_open && inner.state != BreakerState::Open {
            inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            self.transition(&mut inner, BreakerState::Open);
            warn!(
                provider = %self.provider,
                consecutive_failures = inner.consecutive_failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }

    /// Force the breaker open until [`force_reset`](Self::force_reset)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Open {
            inner.next_attempt = None;
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            self.transition(&mut inner, BreakerState::Open);
        } else {
            inner.next_attempt = None;
        }
    }

    /// Reset to closed and zero the failure counter.
    ///
    /// Used operationally and by the health monitor as the traffic-independent
    /// recovery signal.
    pub fn force_reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.next_attempt = None;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
            debug!(provider = %self.provider, "circuit breaker reset");
        }
    }

    /// Point-in-time view of the breaker
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let retry_after = match inner.state {
            BreakerState::Open => inner
                .next_attempt
                .map(|at| at.saturating_duration_since(Instant::now())),
            _ => None,
        };
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_after,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        self.events.emit(GatewayEvent::BreakerTransition {
            provider: self.provider.clone(),
            from: from.name(),
            to: to.name(),
            consecutive_failures: inner.consecutive_failures,
        });
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Lazy per-provider breaker map.
///
/// Breakers are created on first access with the registry's default config
/// and never removed except through [`remove`](Self::remove).
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
    events: Arc<dyn EventSink>,
}

impl BreakerRegistry {
    /// Create a registry with a default per-breaker config
    #[must_use]
    pub fn new(default_config: BreakerConfig) -> Self {
        Self::with_events(default_config, Arc::new(NullSink))
    }

    /// Create a registry whose breakers emit transition events
    #[must_use]
    pub fn with_events(default_config: BreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            events,
        }
    }

    /// Get or lazily create the breaker for a provider
    #[must_use]
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_events(
                    provider,
                    self.default_config,
                    Arc::clone(&self.events),
                ))
            })
            .clone()
    }

    /// Whether a provider's breaker currently fails fast.
    ///
    /// A provider with no breaker yet has never failed, so it reports closed.
    #[must_use]
    pub fn is_open(&self, provider: &str) -> bool {
        self.breakers
            .get(provider)
            .is_some_and(|b| b.is_open())
    }

    /// Administrative removal of a provider's breaker state
    pub fn remove(&self, provider: &str) -> bool {
        self.breakers.remove(provider).is_some()
    }

    /// Snapshots of every breaker in the registry
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_millis(50),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(GatewayError::Connection("refused".into())) })
            .await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("p", fast_config(3));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_open_fails_fast_without_running_work() {
        let breaker = CircuitBreaker::new("p", fast_config(1));
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, GatewayError>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::BreakerOpen { retry_after, .. }) if retry_after > Duration::ZERO
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Fast rejection is not a new provider failure
        assert_eq!(breaker.snapshot().total_failures, 1);
    }

    #[tokio::test]
    async fn test_half_open_success_closes_and_zeroes_counter() {
        let breaker = CircuitBreaker::new("p", fast_config(1));
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = breaker.execute(|| async { Ok::<_, GatewayError>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        let snap = breaker.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("p", fast_config(1));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The probe attempt fails and immediately reopens the breaker
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.is_open());
        assert_eq!(breaker.snapshot().times_opened, 2);
    }

    #[tokio::test]
    async fn test_success_resets_counter_while_closed() {
        let breaker = CircuitBreaker::new("p", fast_config(3));
        fail(&breaker).await;
        fail(&breaker).await;
        let _ = breaker.execute(|| async { Ok::<_, GatewayError>(()) }).await;
        // Two more failures must not reach the threshold of three
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_execution_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "p",
            BreakerConfig {
                failure_threshold: 1,
                timeout: Duration::from_millis(10),
                reset_timeout: Duration::from_secs(60),
            },
        );
        let result = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, GatewayError>(())
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let breaker = CircuitBreaker::new("p", fast_config(5));
        breaker.force_open();
        assert!(breaker.is_open());

        // Forced open has no scheduled attempt; it stays open past the
        // reset window
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.is_open());

        breaker.force_reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        let result = breaker.execute(|| async { Ok::<_, GatewayError>(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_registry_lazy_create_and_remove() {
        let registry = BreakerRegistry::new(fast_config(1));
        assert!(!registry.is_open("p1"));

        let breaker = registry.breaker("p1");
        fail(&breaker).await;
        assert!(registry.is_open("p1"));
        assert!(Arc::ptr_eq(&breaker, &registry.breaker("p1")));

        assert!(registry.remove("p1"));
        assert!(!registry.is_open("p1"));
        assert_eq!(registry.breaker("p1").state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_transition_events_emitted() {
        let (sink, mut rx) = crate::events::ChannelSink::new();
        let breaker = CircuitBreaker::with_events("p", fast_config(1), Arc::new(sink));
        fail(&breaker).await;

        match rx.try_recv() {
            Ok(GatewayEvent::BreakerTransition { from, to, .. }) => {
                assert_eq!(from, BreakerStateName::Closed);
                assert_eq!(to, BreakerStateName::Open);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
