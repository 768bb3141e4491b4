//! Local state machine: status storage, entry actions, reset timer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use breakwater_types::{BreakerError, Clock, Status};

use crate::counter::ErrorCounter;

/// Gate decision for a status: Closed and Half-Open execute, Disabled
/// bypasses scoring, Open and ForcedOpen short-circuit with their own
/// errors.
pub fn allow(status: Status) -> Result<(), BreakerError> {
    match status {
        Status::Closed | Status::HalfOpen | Status::Disabled => Ok(()),
        Status::Open => Err(BreakerError::Unavailable),
        Status::ForcedOpen => Err(BreakerError::ForcedOpen),
    }
}

/// Invoked when the reset timer fires while the machine is still Open.
/// The breaker uses it to route the Half-Open probe through the
/// coordinator; without a hook the machine probes locally.
pub type ResetHook = Arc<dyn Fn() + Send + Sync>;

struct MachineState {
    status: Status,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every arm/cancel; a fire with a stale generation is a
    /// no-op, which closes the race between cancellation and the timer
    /// callback.
    timer_generation: u64,
}

struct Inner {
    state: RwLock<MachineState>,
    counter: ErrorCounter,
    break_duration: Duration,
    reset_hook: Mutex<Option<ResetHook>>,
}

/// Per-instance Closed/Open/HalfOpen/Disabled/ForcedOpen machine.
///
/// Reads take a shared lock; transitions take the exclusive lock and run
/// their entry actions (counter reset, timer arm/cancel) under it.
#[derive(Clone)]
pub struct StateMachine {
    inner: Arc<Inner>,
}

impl StateMachine {
    pub fn new(
        sampling_duration: Duration,
        break_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(MachineState {
                    status: Status::Closed,
                    timer: None,
                    timer_generation: 0,
                }),
                counter: ErrorCounter::new(sampling_duration, clock),
                break_duration,
                reset_hook: Mutex::new(None),
            }),
        }
    }

    /// Install the timer-fire hook. Set once by the breaker at construction.
    pub fn set_reset_hook(&self, hook: ResetHook) {
        *self.inner.reset_hook.lock() = Some(hook);
    }

    pub fn current(&self) -> Status {
        self.inner.state.read().status
    }

    pub fn counter(&self) -> &ErrorCounter {
        &self.inner.counter
    }

    /// Scored transition. No-op when already in `to`, when the machine is
    /// in an administrative state, or when `to` itself is administrative;
    /// those move only through [`set_administrative`].
    ///
    /// Returns whether the transition applied.
    ///
    /// [`set_administrative`]: StateMachine::set_administrative
    pub fn transition(&self, to: Status) -> bool {
        if to.is_administrative() {
            return false;
        }
        let mut state = self.inner.state.write();
        if state.status == to || state.status.is_administrative() {
            return false;
        }
        Inner::apply(&self.inner, &mut state, to);
        true
    }

    /// Administrative transition: applies unconditionally (except when
    /// already in `to`). Used for ForceOpen/Disable and the explicit return
    /// to Closed.
    pub fn set_administrative(&self, to: Status) -> bool {
        let mut state = self.inner.state.write();
        if state.status == to {
            return false;
        }
        Inner::apply(&self.inner, &mut state, to);
        true
    }

    /// Replace the reset timer with one firing after `duration`. Used when
    /// a remote Open carries its own deadline.
    pub fn schedule_reset(&self, duration: Duration) {
        let mut state = self.inner.state.write();
        Inner::arm_timer(&self.inner, &mut state, duration);
    }

    /// Stop any pending reset timer.
    pub fn cancel_reset(&self) {
        let mut state = self.inner.state.write();
        Inner::disarm_timer(&mut state);
    }
}

impl Inner {
    fn apply(this: &Arc<Self>, state: &mut MachineState, to: Status) {
        let from = state.status;
        state.status = to;
        this.counter.reset();
        Self::disarm_timer(state);
        if to == Status::Open {
            Self::arm_timer(this, state, this.break_duration);
        }
        debug!(from = %from, to = %to, "state transition");
    }

    fn arm_timer(this: &Arc<Self>, state: &mut MachineState, duration: Duration) {
        Self::disarm_timer(state);
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let inner = Arc::clone(this);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            Self::fire_reset(&inner, generation);
        }));
    }

    fn disarm_timer(state: &mut MachineState) {
        state.timer_generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn fire_reset(this: &Arc<Self>, generation: u64) {
        {
            let state = this.state.read();
            if state.timer_generation != generation || state.status != Status::Open {
                return;
            }
        }
        let hook = this.reset_hook.lock().clone();
        match hook {
            Some(hook) => hook(),
            None => {
                let mut state = this.state.write();
                // Re-check under the exclusive lock.
                if state.timer_generation == generation && state.status == Status::Open {
                    Self::apply(this, &mut state, Status::HalfOpen);
                }
            }
        }
    }
}
