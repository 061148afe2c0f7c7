//! Reliability & Routing Engine
//!
//! The component set that decides which provider handles a request, how
//! failures are detected and contained, how retries and fallbacks are
//! ordered, how concurrency is bounded, and how results and connections are
//! cached and reused.
//!
//! Dependency order, leaves first: [`pool`] → [`cache`] → [`queue`] →
//! [`breaker`] → [`health`] → [`fallback`] → [`facade`].

pub mod breaker;
pub mod cache;
pub mod facade;
pub mod fallback;
pub mod health;
pub mod pool;
pub mod queue;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use cache::{spawn_sweeper, CacheConfig, CacheHealth, CacheStats, TtlCache};
pub use facade::{ExecuteOptions, FacadeHealth, FacadeStats, PerformanceFacade};
pub use fallback::{FallbackConfig, FallbackEngine, FallbackStrategy};
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use pool::{PoolConfig, PoolManager};
pub use queue::{QueueConfig, QueueStats, WorkQueue};
