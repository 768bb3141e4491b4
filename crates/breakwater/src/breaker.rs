//! The breaker: public execute surface, scoring policies, coordination.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use breakwater_types::{
    BreakerConfig, BreakerError, Clock, CommitWeights, ConfigError, ConnectError, Coordination,
    CoordinationError, Outcome, Status, StatusSnapshot, SystemClock,
};

use crate::counter::{is_healthy, is_unhealthy};
use crate::machine::StateMachine;
use crate::subscriber;

/// Distributed circuit breaker for one logical dependency.
///
/// Every breaker constructed with the same coordinator and channel shares
/// one circuit: a transition committed by any of them is broadcast and
/// applied by the rest, so peers flip state without waiting for their own
/// local evidence.
///
/// ```ignore
/// let coordination = Arc::new(RedisCoordination::connect("redis://localhost").await?);
/// let breaker = Breaker::connect(coordination, "orders-db", BreakerConfig::default()).await?;
///
/// let row = breaker.execute(|| async { db.fetch(id).await }).await?;
/// ```
pub struct Breaker {
    shared: Arc<BreakerShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

pub(crate) struct BreakerShared {
    machine: StateMachine,
    coordination: Arc<dyn Coordination>,
    channel: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    terminated: AtomicBool,
    /// Held (read) across every scoring section; `stop` takes it in write
    /// mode to wait out in-flight scoring.
    scoring_gate: RwLock<()>,
}

impl Breaker {
    /// Connect a breaker on `channel` using the wall clock.
    pub async fn connect(
        coordination: Arc<dyn Coordination>,
        channel: impl Into<String>,
        config: BreakerConfig,
    ) -> Result<Self, ConnectError> {
        Self::connect_with_clock(coordination, channel, config, Arc::new(SystemClock)).await
    }

    /// Connect with an injected clock. Counter decay, open deadlines, and
    /// shared counter windows all route through it.
    pub async fn connect_with_clock(
        coordination: Arc<dyn Coordination>,
        channel: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConnectError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(ConfigError::EmptyChannel.into());
        }
        config.validate()?;

        let machine = StateMachine::new(
            config.sampling_duration,
            config.break_duration,
            clock.clone(),
        );
        let subscription = coordination.subscribe(&channel).await?;

        let shared = Arc::new(BreakerShared {
            machine,
            coordination,
            channel,
            config,
            clock,
            terminated: AtomicBool::new(false),
            scoring_gate: RwLock::new(()),
        });

        // Reset-timer fires probe through the coordinator, not just locally.
        let weak = Arc::downgrade(&shared);
        shared.machine.set_reset_hook(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                tokio::spawn(async move { shared.probe_reset().await });
            }
        }));

        // Seed from whatever the peers have already established.
        match shared.coordination.status(&shared.channel).await {
            Ok(Some(snapshot)) => shared.adopt_snapshot(snapshot),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    channel = %shared.channel,
                    error = %e,
                    "initial status read failed; starting closed"
                );
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let listener = subscriber::spawn(Arc::downgrade(&shared), subscription, stop_rx);

        info!(channel = %shared.channel, "breaker connected");
        Ok(Self {
            shared,
            listener: Mutex::new(Some(listener)),
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Gate, invoke, score.
    ///
    /// The operation's error passes through verbatim inside
    /// [`BreakerError::Operation`]; gate rejections return without invoking
    /// it. A coordinator write that fails in the same call is joined onto
    /// the result rather than swallowed.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let shared = &self.shared;
        if shared.terminated.load(Ordering::Acquire) {
            return Err(BreakerError::Terminated);
        }
        match shared.machine.current() {
            Status::ForcedOpen => Err(BreakerError::ForcedOpen),
            Status::Open => Err(BreakerError::Unavailable),
            Status::Disabled => op().await.map_err(BreakerError::operation),
            Status::HalfOpen => shared.execute_half_open(op).await,
            Status::Closed => BreakerShared::execute_closed(shared, op).await,
        }
    }

    /// Current local status.
    pub fn status(&self) -> Status {
        self.shared.machine.current()
    }

    /// Administratively reject all calls, locally and for every peer.
    pub async fn force_open(&self) -> Result<(), BreakerError> {
        self.admin_set(Status::ForcedOpen).await
    }

    /// Administratively bypass the gate and scoring, locally and for every
    /// peer.
    pub async fn disable(&self) -> Result<(), BreakerError> {
        self.admin_set(Status::Disabled).await
    }

    /// Explicit return to scored operation from an administrative status.
    pub async fn reset(&self) -> Result<(), BreakerError> {
        self.admin_set(Status::Closed).await
    }

    /// Tear down: close the subscription and join the listener, stop the
    /// reset timer, wait for in-flight scoring. Idempotent; any later
    /// `execute` returns [`BreakerError::Terminated`].
    pub async fn stop(&self) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let stop_tx = self.stop_tx.lock().take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    debug!(error = %e, "listener join failed");
                }
            }
        }
        self.shared.machine.cancel_reset();
        let _ = self.shared.scoring_gate.write().await;
        info!(channel = %self.shared.channel, "breaker stopped");
    }

    async fn admin_set(&self, status: Status) -> Result<(), BreakerError> {
        if self.shared.terminated.load(Ordering::Acquire) {
            return Err(BreakerError::Terminated);
        }
        self.shared.machine.set_administrative(status);
        self.shared
            .coordination
            .set_status(
                &self.shared.channel,
                status,
                self.shared.config.key_idle_ttl,
            )
            .await?;
        Ok(())
    }
}

impl BreakerShared {
    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn elapsed_since(&self, started_ms: u64) -> Duration {
        Duration::from_millis(self.now().saturating_sub(started_ms))
    }

    fn weights(&self, now_ms: u64, failure_count: u32, success_count: u32) -> CommitWeights {
        CommitWeights {
            now_ms,
            failure_count,
            failure_threshold: self.config.failure_threshold,
            failure_period: self.config.sampling_duration,
            success_count,
            success_threshold: self.config.success_threshold,
            success_period: self.config.sampling_duration,
            open_timeout_ms: now_ms
                .saturating_add(self.config.break_duration.as_millis() as u64),
            key_idle_ttl: self.config.key_idle_ttl,
        }
    }

    async fn execute_half_open<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let started = self.now();
        let result = op().await;

        let _scoring = self.scoring_gate.read().await;
        if self.terminated.load(Ordering::Acquire) {
            return result.map_err(BreakerError::operation);
        }
        match result {
            Err(e) => {
                // Any failure during probing re-opens immediately.
                let coordination = self.open_and_commit(1).await.err();
                Err(BreakerError::Operation {
                    error: e.into(),
                    coordination,
                })
            }
            Ok(value) => {
                let slow = (self.config.slow_weight)(self.elapsed_since(started));
                if slow > 0 {
                    let (success, failure) = self.machine.counter().add(0, slow);
                    if is_unhealthy(
                        success,
                        failure,
                        self.config.failure_ratio,
                        self.config.failure_threshold,
                    ) {
                        self.open_and_commit(ceil_count(failure)).await?;
                        return Ok(value);
                    }
                }
                let (success, _) = self.machine.counter().add(1, 0);
                if is_healthy(success, self.config.success_threshold) {
                    self.close_and_commit(ceil_count(success)).await?;
                }
                Ok(value)
            }
        }
    }

    async fn execute_closed<T, E, F, Fut>(shared: &Arc<Self>, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let started = shared.now();
        let heartbeat = Self::spawn_heartbeat(shared);
        let result = op().await;
        drop(heartbeat);

        let _scoring = shared.scoring_gate.read().await;
        if shared.terminated.load(Ordering::Acquire) {
            return result.map_err(BreakerError::operation);
        }
        match result {
            Err(e) => {
                let error = e.into();
                let weight = (shared.config.failure_weight)(&error)
                    .saturating_add((shared.config.slow_weight)(shared.elapsed_since(started)));
                let mut coordination = None;
                // A zero contribution must not move the state.
                if weight > 0 {
                    let (success, failure) = shared.machine.counter().add(0, weight);
                    if is_unhealthy(
                        success,
                        failure,
                        shared.config.failure_ratio,
                        shared.config.failure_threshold,
                    ) {
                        coordination = shared.open_and_commit(ceil_count(failure)).await.err();
                    }
                }
                Err(BreakerError::Operation { error, coordination })
            }
            Ok(value) => {
                let slow = (shared.config.slow_weight)(shared.elapsed_since(started));
                let (success, failure) = shared.machine.counter().add(0, slow);
                if slow > 0
                    && is_unhealthy(
                        success,
                        failure,
                        shared.config.failure_ratio,
                        shared.config.failure_threshold,
                    )
                {
                    shared.open_and_commit(ceil_count(failure)).await?;
                    return Ok(value);
                }
                shared.machine.counter().add(1, 0);
                Ok(value)
            }
        }
    }

    /// Background slow-call sampling while a Closed-state op runs: every
    /// heartbeat period, the period itself is scored through the slow-call
    /// policy as a virtual duration. Aborted as soon as the op returns.
    fn spawn_heartbeat(shared: &Arc<Self>) -> Option<AbortGuard> {
        let period = shared.config.heartbeat_duration;
        if period.is_zero() {
            return None;
        }
        let shared = Arc::clone(shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shared.machine.current() != Status::Closed {
                    break;
                }
                let weight = (shared.config.slow_weight)(period);
                if weight == 0 {
                    continue;
                }
                let (success, failure) = shared.machine.counter().add(0, weight);
                if is_unhealthy(
                    success,
                    failure,
                    shared.config.failure_ratio,
                    shared.config.failure_threshold,
                ) {
                    if let Err(e) = shared.open_and_commit(ceil_count(failure)).await {
                        warn!(
                            channel = %shared.channel,
                            error = %e,
                            "heartbeat open commit failed"
                        );
                    }
                    break;
                }
            }
        });
        Some(AbortGuard(handle))
    }

    /// Flip local state to Open, then commit the crossing. The local flip
    /// always lands first so the caller's next execute short-circuits even
    /// if the coordinator is unreachable.
    async fn open_and_commit(&self, weighted_failures: u32) -> Result<(), CoordinationError> {
        let now = self.now();
        self.machine.transition(Status::Open);
        let weights = self.weights(now, weighted_failures.max(1), 0);
        match self
            .coordination
            .commit(&self.channel, Outcome::Failure, &weights)
            .await
        {
            Ok(status) => {
                self.apply_committed(status);
                Ok(())
            }
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    error = %e,
                    "open commit failed; keeping local transition"
                );
                Err(e)
            }
        }
    }

    async fn close_and_commit(&self, weighted_successes: u32) -> Result<(), CoordinationError> {
        let now = self.now();
        self.machine.transition(Status::Closed);
        let weights = self.weights(now, 0, weighted_successes.max(1));
        match self
            .coordination
            .commit(&self.channel, Outcome::Success, &weights)
            .await
        {
            Ok(status) => {
                self.apply_committed(status);
                Ok(())
            }
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    error = %e,
                    "close commit failed; keeping local transition"
                );
                Err(e)
            }
        }
    }

    /// Adopt the post-commit shared status; a peer may have advanced the
    /// circuit past what this instance decided.
    fn apply_committed(&self, status: Status) {
        if status.is_administrative() {
            self.machine.set_administrative(status);
        } else {
            self.machine.transition(status);
        }
    }

    fn adopt_snapshot(&self, snapshot: StatusSnapshot) {
        if snapshot.status.is_administrative() {
            self.machine.set_administrative(snapshot.status);
            return;
        }
        self.machine.transition(snapshot.status);
        if snapshot.status == Status::Open {
            if let Some(reset_at) = snapshot.reset_at_ms {
                let remaining = reset_at.saturating_sub(self.now());
                self.machine.schedule_reset(Duration::from_millis(remaining));
            }
        }
    }

    /// Remote transition from the pub/sub stream. Open/HalfOpen go through
    /// the scored path so they never clobber a local administrative state.
    /// Closed applies unconditionally: while the shared status is
    /// administrative the coordinator refuses commits, so a Closed
    /// broadcast can only be an explicit SetStatus reset. A remote Open
    /// adopts the remote deadline.
    pub(crate) async fn apply_broadcast(&self, status: Status) {
        debug!(channel = %self.channel, status = %status, "remote transition received");
        if status.is_administrative() || status == Status::Closed {
            self.machine.set_administrative(status);
            return;
        }
        self.machine.transition(status);
        if status == Status::Open {
            if let Ok(Some(snapshot)) = self.coordination.status(&self.channel).await {
                if snapshot.status == Status::Open {
                    if let Some(reset_at) = snapshot.reset_at_ms {
                        let remaining = reset_at.saturating_sub(self.now());
                        self.machine.schedule_reset(Duration::from_millis(remaining));
                    }
                }
            }
        }
    }

    /// Reset-timer fire: ask the coordinator before probing so the shared
    /// hash flips Open→HalfOpen exactly once across all peers.
    async fn probe_reset(self: Arc<Self>) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        let now = self.now();
        match self.coordination.begin(&self.channel, now).await {
            Ok(Status::Open) => {
                let remaining = match self.coordination.status(&self.channel).await {
                    Ok(Some(snapshot)) => snapshot
                        .reset_at_ms
                        .map(|at| Duration::from_millis(at.saturating_sub(now))),
                    _ => None,
                };
                let delay = remaining
                    .filter(|d| !d.is_zero())
                    .unwrap_or(self.config.break_duration);
                debug!(channel = %self.channel, ?delay, "shared circuit still open; probe rescheduled");
                self.machine.schedule_reset(delay);
            }
            Ok(status) => self.apply_committed(status),
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    error = %e,
                    "probe begin failed; probing locally"
                );
                self.machine.transition(Status::HalfOpen);
            }
        }
    }
}

struct AbortGuard(JoinHandle<()>);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn ceil_count(weighted: f64) -> u32 {
    weighted.ceil().clamp(0.0, u32::MAX as f64) as u32
}

/// Wrap a call with breaker protection, flattening the error to
/// `anyhow::Error` for callers that do not match on the taxonomy.
pub async fn guarded<T, E, F, Fut>(breaker: &Breaker, op: F) -> Result<T, anyhow::Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    breaker.execute(op).await.map_err(Into::into)
}
