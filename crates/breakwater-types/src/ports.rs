//! Coordinator port: the capability set a breaker needs from a shared store.
//!
//! Concrete adapters (Redis-scripted, in-memory) live in
//! `breakwater-coordination`; the breaker itself stays unaware of which is
//! in use.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoordinationResult;
use crate::status::Status;

/// Result of one scored call, as reported to the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Weighted counter increments and the durations governing the shared
/// counter windows, passed with every commit.
#[derive(Clone, Debug)]
pub struct CommitWeights {
    /// Caller's clock reading; governs counter-window arithmetic so peers
    /// and tests share one time source.
    pub now_ms: u64,
    /// Weighted failure increment.
    pub failure_count: u32,
    /// Shared failure threshold; reaching it while Closed opens the circuit.
    pub failure_threshold: u32,
    /// Window after which an untouched failure counter resets.
    pub failure_period: Duration,
    /// Weighted success increment.
    pub success_count: u32,
    /// Shared success threshold; reaching it while Half-Open closes the
    /// circuit.
    pub success_threshold: u32,
    /// Window after which an untouched success counter resets.
    pub success_period: Duration,
    /// Epoch-ms deadline at which a freshly-opened circuit auto-probes.
    pub open_timeout_ms: u64,
    /// Idle TTL applied to the whole shared hash.
    pub key_idle_ttl: Duration,
}

/// Read-only view of the shared key state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: Status,
    /// Epoch-ms deadline of an Open circuit, when one is recorded. Peers
    /// adopt it instead of arming a full local break duration.
    pub reset_at_ms: Option<u64>,
}

/// Atomic shared-state transitions plus broadcast, keyed by the breaker's
/// channel name.
///
/// # Atomicity
///
/// `begin` and `commit` are read-modify-write transactions: two calls for
/// the same key never interleave. The canonical implementation executes a
/// single server-side script per call and publishes the new status from
/// inside the same atomic step, so per-key broadcast order matches commit
/// order.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Read the current shared status; when it is Open and `now_ms` has
    /// passed the recorded deadline, atomically transition to Half-Open and
    /// return Half-Open.
    async fn begin(&self, key: &str, now_ms: u64) -> CoordinationResult<Status>;

    /// Apply one scoring outcome to the shared state and return the
    /// post-commit status.
    ///
    /// Closed + failure increments the windowed failure counter and opens at
    /// the threshold; Half-Open + success increments the success counter and
    /// closes at the threshold; Half-Open + failure re-opens with a fresh
    /// deadline; administrative statuses are never changed by a commit.
    async fn commit(
        &self,
        key: &str,
        outcome: Outcome,
        weights: &CommitWeights,
    ) -> CoordinationResult<Status>;

    /// Administrative override: store the status, refresh the key TTL, and
    /// broadcast to subscribers.
    async fn set_status(&self, key: &str, status: Status, ttl: Duration)
        -> CoordinationResult<()>;

    /// Read-only snapshot; `None` when the key has never been written or
    /// has expired.
    async fn status(&self, key: &str) -> CoordinationResult<Option<StatusSnapshot>>;

    /// Subscribe to the key's transition stream. Every transition (including
    /// administrative overrides) is eventually observed, in per-key commit
    /// order.
    async fn subscribe(&self, key: &str) -> CoordinationResult<Box<dyn StatusSubscriber>>;
}

/// A live subscription to one key's transition stream.
#[async_trait]
pub trait StatusSubscriber: Send {
    /// Next transition, or `None` once the stream is closed.
    async fn next_status(&mut self) -> CoordinationResult<Option<Status>>;

    /// Close the subscription; subsequent `next_status` calls return `None`.
    async fn unsubscribe(&mut self) -> CoordinationResult<()>;
}
