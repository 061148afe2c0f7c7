//! Priority Work Queue
//!
//! Admission control for outbound work: N strict-priority FIFO buckets
//! (priority 0 is highest), a hard bound on total queued items, and a bound
//! on concurrently executing items. Admission past the queued bound is
//! rejected immediately with [`GatewayError::QueueFull`], never blocked.
//!
//! A per-item timer fires if the item is still queued when its wait timeout
//! elapses, failing it with [`GatewayError::QueueTimeout`] — distinct from an
//! in-flight timeout — without ever starting the work. Completion of any item
//! always attempts to dispatch the next eligible item.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::events::{EventSink, GatewayEvent, NullSink};

// ============================================================================
// Configuration
// ============================================================================

/// Queue tuning
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Number of priority levels (priorities are clamped into this range)
    pub levels: usize,
    /// Maximum queued items across all levels
    pub max_queued: usize,
    /// Maximum concurrently executing items
    pub max_concurrent: usize,
    /// Wait timeout applied when `submit` is called without one
    pub default_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            levels: 3,
            max_queued: 200,
            max_concurrent: 16,
            default_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Internals
// ============================================================================

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedItem {
    id: u64,
    enqueued_at: Instant,
    job: Job,
    // Shared with the wait-timeout task; bucket removal is the arbiter of
    // which side takes the sender.
    fail: Box<dyn FnOnce(GatewayError) + Send>,
}

struct QueueState {
    buckets: Vec<VecDeque<QueuedItem>>,
    queued: usize,
    running: usize,
}

/// Point-in-time queue statistics
#[derive(Clone, Copy, Debug)]
pub struct QueueStats {
    /// Items currently waiting
    pub queued: usize,
    /// Items currently executing
    pub running: usize,
    /// Configured queued-item capacity
    pub capacity: usize,
    /// Configured concurrency bound
    pub max_concurrent: usize,
    /// Total accepted items
    pub total_enqueued: u64,
    /// Total admission rejections
    pub total_rejected: u64,
    /// Total items expired while waiting
    pub total_timed_out: u64,
    /// Total items that started and finished
    pub total_completed: u64,
}

impl QueueStats {
    /// Queued fraction of capacity, 0.0..=1.0
    #[must_use]
    pub fn queue_utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.queued as f64 / self.capacity as f64
        }
    }

    /// Running fraction of the concurrency bound, 0.0..=1.0
    #[must_use]
    pub fn concurrency_utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            0.0
        } else {
            self.running as f64 / self.max_concurrent as f64
        }
    }
}

// ============================================================================
// Work Queue
// ============================================================================

/// Strict-priority, concurrency-bounded work queue
pub struct WorkQueue {
    shared: Arc<Shared>,
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    total_enqueued: AtomicU64,
    total_rejected: AtomicU64,
    total_timed_out: AtomicU64,
    total_completed: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl WorkQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self::with_events(config, Arc::new(NullSink))
    }

    /// Create a queue that emits saturation events
    #[must_use]
    pub fn with_events(config: QueueConfig, events: Arc<dyn EventSink>) -> Self {
        let levels = config.levels.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState {
                    buckets: (0..levels).map(|_| VecDeque::new()).collect(),
                    queued: 0,
                    running: 0,
                }),
                next_id: AtomicU64::new(0),
                total_enqueued: AtomicU64::new(0),
                total_rejected: AtomicU64::new(0),
                total_timed_out: AtomicU64::new(0),
                total_completed: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Submit work and await its result.
    ///
    /// `priority` 0 is highest; values past the configured level count are
    /// clamped to the lowest level. Returns [`GatewayError::QueueFull`]
    /// immediately when the queue is at capacity.
    pub async fn submit<T, F, Fut>(
        &self,
        work: F,
        priority: usize,
        timeout: Option<Duration>,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let shared = &self.shared;
        let timeout = timeout.unwrap_or(shared.config.default_timeout);
        let priority = priority.min(shared.config.levels.max(1) - 1);
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel::<Result<T, GatewayError>>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let job_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = work().await;
                if let Some(tx) = job_slot.lock().take() {
                    let _ = tx.send(result);
                }
            })
        });

        let fail_slot = Arc::clone(&slot);
        let fail: Box<dyn FnOnce(GatewayError) + Send> = Box::new(move |err| {
            if let Some(tx) = fail_slot.lock().take() {
                let _ = tx.send(Err(err));
            }
        });

        {
            let mut state = shared.state.lock();
            if state.queued >= shared.config.max_queued {
                drop(state);
                shared.total_rejected.fetch_add(1, Ordering::Relaxed);
                shared.events.emit(GatewayEvent::QueueSaturated {
                    queued: shared.config.max_queued,
                    capacity: shared.config.max_queued,
                });
                return Err(GatewayError::QueueFull {
                    queued: shared.config.max_queued,
                    capacity: shared.config.max_queued,
                });
            }
            state.buckets[priority].push_back(QueuedItem {
                id,
                enqueued_at: Instant::now(),
                job,
                fail,
            });
            state.queued += 1;
        }
        shared.total_enqueued.fetch_add(1, Ordering::Relaxed);
        trace!(item = id, priority, "queued");

        // Wait-timeout watchdog: only fires while the item is still in its
        // bucket. Removal under the state lock decides dispatch vs. expiry.
        let watchdog = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut state = watchdog.state.lock();
                let bucket = &mut state.buckets[priority];
                match bucket.iter().position(|item| item.id == id) {
                    Some(pos) => {
                        let item = bucket.remove(pos);
                        state.queued -= 1;
                        item
                    }
                    None => return,
                }
            };
            if let Some(item) = expired {
                watchdog.total_timed_out.fetch_add(1, Ordering::Relaxed);
                debug!(item = id, "expired while queued");
                let waited = item.enqueued_at.elapsed();
                (item.fail)(GatewayError::QueueTimeout { waited });
            }
        });

        Shared::dispatch(shared);

        rx.await
            .unwrap_or_else(|_| Err(GatewayError::Internal("queued work was dropped".to_string())))
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let shared = &self.shared;
        let (queued, running) = {
            let state = shared.state.lock();
            (state.queued, state.running)
        };
        QueueStats {
            queued,
            running,
            capacity: shared.config.max_queued,
            max_concurrent: shared.config.max_concurrent,
            total_enqueued: shared.total_enqueued.load(Ordering::Relaxed),
            total_rejected: shared.total_rejected.load(Ordering::Relaxed),
            total_timed_out: shared.total_timed_out.load(Ordering::Relaxed),
            total_completed: shared.total_completed.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    /// Start as many queued items as the concurrency bound allows, always
    /// pulling from the lowest-numbered non-empty bucket.
    fn dispatch(shared: &Arc<Self>) {
        loop {
            let item = {
                let mut state = shared.state.lock();
                if state.running >= shared.config.max_concurrent {
                    return;
                }
                let Some(item) = state
                    .buckets
                    .iter_mut()
                    .find(|b| !b.is_empty())
                    .and_then(VecDeque::pop_front)
                else {
                    return;
                };
                state.queued -= 1;
                state.running += 1;
                item
            };

            trace!(
                item = item.id,
                waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
                "dispatching"
            );
            let runner = Arc::clone(shared);
            tokio::spawn(async move {
                (item.job)().await;
                runner.total_completed.fetch_add(1, Ordering::Relaxed);
                runner.state.lock().running -= 1;
                Shared::dispatch(&runner);
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
