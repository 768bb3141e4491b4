//! Exponentially-decayed success/failure counter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use breakwater_types::Clock;

/// Sliding-window error statistics.
///
/// Two floating-point accumulators decay by `exp(-age/τ)` where τ is the
/// sampling duration and `age` is the time since the last update. The
/// counter is a local estimator used only to decide threshold crossings;
/// small skew across peers is acceptable.
pub struct ErrorCounter {
    inner: Mutex<CounterInner>,
    clock: Arc<dyn Clock>,
    window_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct CounterInner {
    success: f64,
    failure: f64,
    updated_at_ms: u64,
}

impl ErrorCounter {
    pub fn new(sampling_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        let updated_at_ms = clock.now_ms();
        Self {
            inner: Mutex::new(CounterInner {
                success: 0.0,
                failure: 0.0,
                updated_at_ms,
            }),
            clock,
            window_ms: sampling_duration.as_millis() as f64,
        }
    }

    /// Decay both accumulators to now, add the deltas, and return the
    /// resulting weighted totals.
    pub fn add(&self, successes: u32, failures: u32) -> (f64, f64) {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        inner.decay_to(now, self.window_ms);
        inner.success += f64::from(successes);
        inner.failure += f64::from(failures);
        (inner.success, inner.failure)
    }

    /// Current weighted totals with decay applied, without mutating.
    pub fn rate(&self) -> (f64, f64) {
        let inner = self.inner.lock();
        let now = self.clock.now_ms();
        let factor = decay_factor(now.saturating_sub(inner.updated_at_ms), self.window_ms);
        (inner.success * factor, inner.failure * factor)
    }

    /// Zero both accumulators. Called on every state entry.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.success = 0.0;
        inner.failure = 0.0;
        inner.updated_at_ms = self.clock.now_ms();
    }
}

impl CounterInner {
    fn decay_to(&mut self, now_ms: u64, window_ms: f64) {
        let factor = decay_factor(now_ms.saturating_sub(self.updated_at_ms), window_ms);
        self.success *= factor;
        self.failure *= factor;
        self.updated_at_ms = now_ms;
    }
}

fn decay_factor(age_ms: u64, window_ms: f64) -> f64 {
    if age_ms == 0 {
        return 1.0;
    }
    (-(age_ms as f64) / window_ms).exp()
}

/// `f/(s+f)`, defined as 0 for an empty counter.
pub fn failure_rate(success: f64, failure: f64) -> f64 {
    let total = success + failure;
    if total <= 0.0 {
        0.0
    } else {
        failure / total
    }
}

/// Half-Open exit test: enough weighted successes to close.
pub fn is_healthy(success: f64, success_threshold: u32) -> bool {
    success.ceil() as u64 >= u64::from(success_threshold)
}

/// Open-entry test: the failure ratio AND the weighted failure count must
/// both cross. Crossing only one never opens.
pub fn is_unhealthy(
    success: f64,
    failure: f64,
    failure_ratio: f64,
    failure_threshold: u32,
) -> bool {
    failure_rate(success, failure) >= failure_ratio
        && failure.ceil() as u64 >= u64::from(failure_threshold)
}
