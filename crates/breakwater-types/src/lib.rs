//! Shared types and ports for the breakwater distributed circuit breaker.
//!
//! This crate carries everything both sides of the system agree on: the
//! [`Status`] wire encoding, the [`BreakerConfig`] scoring policies, the
//! [`Clock`] abstraction, the error taxonomy, and the [`Coordination`] port
//! that backend adapters implement.

pub mod clock;
pub mod config;
pub mod error;
pub mod ports;
pub mod status;

pub use clock::{Clock, SystemClock};
pub use config::{default_failure_weight, default_slow_weight, BreakerConfig};
pub use error::{
    BreakerError, Cancelled, ConfigError, ConnectError, CoordinationError, CoordinationResult,
    DeadlineExceeded,
};
pub use ports::{CommitWeights, Coordination, Outcome, StatusSnapshot, StatusSubscriber};
pub use status::{Status, UnknownStatus};
