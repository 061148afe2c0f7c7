//! Operational Events
//!
//! Structured events the routing core emits as side notifications: breaker
//! transitions, health check outcomes, queue saturation, cache evictions.
//! The core writes to an [`EventSink`] and never blocks on it; a slow or
//! absent consumer cannot stall a request path.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::provider::HealthStatus;

// ============================================================================
// Event Types
// ============================================================================

/// Circuit breaker state names as they appear in events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerStateName {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// One probe request is allowed through
    HalfOpen,
}

/// Operational events from the routing core
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GatewayEvent {
    /// A circuit breaker changed state
    BreakerTransition {
        /// Provider the breaker guards
        provider: String,
        /// Previous state
        from: BreakerStateName,
        /// New state
        to: BreakerStateName,
        /// Consecutive failures at transition time
        consecutive_failures: u32,
    },

    /// A health check completed
    HealthCheck {
        /// Provider that was probed
        provider: String,
        /// Resulting status
        status: HealthStatus,
        /// Probe duration in milliseconds
        duration_ms: u64,
        /// Error message on failure
        error: Option<String>,
    },

    /// The work queue rejected a request at admission
    QueueSaturated {
        /// Items queued at rejection time
        queued: usize,
        /// Configured capacity
        capacity: usize,
    },

    /// The cache evicted an entry
    CacheEviction {
        /// Evicted key
        key: String,
        /// Whether eviction was TTL expiry (vs. LRU pressure)
        expired: bool,
    },
}

// ============================================================================
// Event Sink
// ============================================================================

/// Non-blocking emitter for [`GatewayEvent`]s.
///
/// `emit` must never block or fail loudly; dropping an event when no one is
/// listening is acceptable.
pub trait EventSink: Send + Sync {
    /// Emit one event (best effort)
    fn emit(&self, event: GatewayEvent);
}

/// Sink that discards everything; useful default for tests
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: GatewayEvent) {}
}

/// Sink backed by an unbounded tokio channel.
///
/// Unbounded so that `emit` is a plain non-async `send` that cannot block a
/// request path; the consumer side is expected to drain promptly.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelSink {
    /// Build a sink and its receiving end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: GatewayEvent) {
        // Receiver gone means nobody is listening; drop the event.
        let _ = self.tx.send(event);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(GatewayEvent::QueueSaturated {
            queued: 100,
            capacity: 100,
        });

        match rx.try_recv() {
            Ok(GatewayEvent::QueueSaturated { queued, capacity }) => {
                assert_eq!(queued, 100);
                assert_eq!(capacity, 100);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(GatewayEvent::CacheEviction {
            key: "k".to_string(),
            expired: true,
        });
    }

    #[test]
    fn test_event_serializes() {
        let event = GatewayEvent::BreakerTransition {
            provider: "p1".to_string(),
            from: BreakerStateName::Closed,
            to: BreakerStateName::Open,
            consecutive_failures: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("BreakerTransition"));
        assert!(json.contains("\"open\""));
    }
}
