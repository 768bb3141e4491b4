//! Error taxonomy for the breaker and its coordinator.

use thiserror::Error;

/// Result type for coordinator operations.
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// Errors from the distributed coordinator.
///
/// These are I/O-class: the breaker keeps serving on its local counters when
/// they occur, but never promotes a local transition to global without a
/// successful commit.
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Redis connection or command failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A non-Redis backing store failed; adapters outside this workspace
    /// wrap their errors here.
    #[error("coordination backend error: {0}")]
    Backend(String),

    /// The subscription stream is closed.
    #[error("subscription closed")]
    Closed,

    /// The peer sent something the wire contract does not allow.
    #[error("coordination protocol error: {0}")]
    Protocol(String),
}

impl CoordinationError {
    /// Create a backend error from any displayable cause.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether retrying the call against the backend could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinationError::Redis(_) => true,
            CoordinationError::Backend(_) => true,
            CoordinationError::Closed => false,
            CoordinationError::Protocol(_) => false,
        }
    }
}

/// Errors surfaced by [`Breaker::execute`] and the administrative API.
///
/// [`Breaker::execute`]: https://docs.rs/breakwater
#[derive(Error, Debug)]
pub enum BreakerError {
    /// The gate is open; the operation was not invoked.
    #[error("service unavailable: circuit is open")]
    Unavailable,

    /// The breaker was forced open administratively.
    #[error("circuit is forced open")]
    ForcedOpen,

    /// The breaker was stopped; no further calls are served.
    #[error("breaker is stopped")]
    Terminated,

    /// The wrapped operation failed. The error passes through verbatim;
    /// when a coordinator write failed in the same call, both travel
    /// together so callers can observe distributed drift.
    #[error("{error}")]
    Operation {
        error: anyhow::Error,
        coordination: Option<CoordinationError>,
    },

    /// The operation succeeded but the coordinator write did not.
    #[error("coordination failed: {0}")]
    Coordination(#[from] CoordinationError),
}

impl BreakerError {
    /// Wrap an operation error with no coordinator failure attached.
    pub fn operation(error: impl Into<anyhow::Error>) -> Self {
        Self::Operation {
            error: error.into(),
            coordination: None,
        }
    }

    /// True for errors produced by the gate itself, before the operation ran.
    pub fn is_gate(&self) -> bool {
        matches!(
            self,
            BreakerError::Unavailable | BreakerError::ForcedOpen | BreakerError::Terminated
        )
    }

    /// The wrapped operation error, if the operation ran and failed.
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            BreakerError::Operation { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The coordinator error carried by this error, if any.
    pub fn coordination_error(&self) -> Option<&CoordinationError> {
        match self {
            BreakerError::Operation { coordination, .. } => coordination.as_ref(),
            BreakerError::Coordination(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from breaker construction: bad configuration or an unreachable
/// coordinator.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

/// Configuration rejected at construction time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failure ratio must be within (0, 1], got {0}")]
    InvalidRatio(f64),

    #[error("{0} must be a positive duration")]
    ZeroDuration(&'static str),

    #[error("{0} must be at least 1")]
    ZeroThreshold(&'static str),

    #[error("channel name must not be empty")]
    EmptyChannel,
}

/// Marker error for a caller-cancelled operation.
///
/// The default failure weight maps it to zero: a caller giving up is not
/// evidence against the dependency.
#[derive(Error, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Marker error for an operation that ran out its deadline.
///
/// Weighted heavier than an ordinary failure by default, alongside
/// [`tokio::time::error::Elapsed`].
#[derive(Error, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;
