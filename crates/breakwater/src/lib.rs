//! # Breakwater
//!
//! Distributed circuit breaker: a per-process failure gate whose
//! Closed → Open → Half-Open machine is shared across processes through a
//! coordinator (Redis hash + pub/sub in production, in-memory for tests).
//!
//! A call flows through [`Breaker::execute`]: the local gate decides to
//! execute, short-circuit, or probe; the result is scored into an
//! exponentially-decayed error counter; a threshold crossing commits the
//! transition atomically on the coordinator, which broadcasts it so every
//! peer flips without waiting for its own evidence.
//!
//! ```ignore
//! use std::sync::Arc;
//! use breakwater::{Breaker, BreakerConfig};
//! use breakwater_coordination::RedisCoordination;
//!
//! let coordination = Arc::new(RedisCoordination::connect("redis://localhost:6379").await?);
//! let breaker = Breaker::connect(coordination, "orders-db", BreakerConfig::default()).await?;
//!
//! match breaker.execute(|| async { db.fetch(id).await }).await {
//!     Ok(row) => { /* dependency healthy */ }
//!     Err(e) if e.is_gate() => { /* short-circuited, serve fallback */ }
//!     Err(e) => { /* the operation's own error, scored */ }
//! }
//! ```
//!
//! Scoring is weighted: operation errors map to failure contributions via a
//! configurable policy (a cancelled call counts zero, a blown deadline
//! counts five), and slow calls accrue extra failures per elapsed interval
//! even when they succeed. Opening requires both the failure ratio and the
//! weighted failure count to cross; crossing only one never opens.

pub mod breaker;
pub mod counter;
pub mod machine;
mod subscriber;

pub use breaker::{guarded, Breaker};
pub use counter::ErrorCounter;
pub use machine::{allow, StateMachine};

// Re-export the shared vocabulary so most callers need only this crate.
pub use breakwater_types::{
    default_failure_weight, default_slow_weight, BreakerConfig, BreakerError, Cancelled, Clock,
    CommitWeights, ConfigError, ConnectError, Coordination, CoordinationError, CoordinationResult,
    DeadlineExceeded, Outcome, Status, StatusSnapshot, StatusSubscriber, SystemClock,
};
