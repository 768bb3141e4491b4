//! Breaker configuration and scoring policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Cancelled, ConfigError, DeadlineExceeded};

/// Maps an operation error to its weighted failure contribution.
pub type FailureWeightFn = Arc<dyn Fn(&anyhow::Error) -> u32 + Send + Sync>;

/// Maps an observed call duration to an additional failure contribution.
pub type SlowWeightFn = Arc<dyn Fn(Duration) -> u32 + Send + Sync>;

/// Tuning for one breaker.
///
/// Defaults follow the reference inputs: a call is scored against a 10 s
/// sampling window, ten weighted failures at a 50% failure ratio open the
/// circuit, the circuit stays open for 5 s, and five weighted successes in
/// half-open close it again.
#[derive(Clone)]
pub struct BreakerConfig {
    /// Time constant of the exponential-decay error counter.
    pub sampling_duration: Duration,
    /// How long Open persists before auto-probing Half-Open.
    pub break_duration: Duration,
    /// Minimum weighted failure count required to open.
    pub failure_threshold: u32,
    /// Minimum failure/(success+failure) ratio required to open.
    /// Both the ratio and the count must hold.
    pub failure_ratio: f64,
    /// Weighted successes required in Half-Open before closing.
    pub success_threshold: u32,
    /// Cadence for background slow-call sampling while Closed.
    /// Zero disables the heartbeat.
    pub heartbeat_duration: Duration,
    /// TTL applied to the shared hash so long-idle keys garbage-collect.
    pub key_idle_ttl: Duration,
    /// Failure weight policy. Defaults to [`default_failure_weight`].
    pub failure_weight: FailureWeightFn,
    /// Slow-call weight policy. Defaults to [`default_slow_weight`].
    pub slow_weight: SlowWeightFn,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let sampling_duration = Duration::from_secs(10);
        Self {
            sampling_duration,
            break_duration: Duration::from_secs(5),
            failure_threshold: 10,
            failure_ratio: 0.5,
            success_threshold: 5,
            heartbeat_duration: Duration::ZERO,
            key_idle_ttl: idle_ttl_for(sampling_duration),
            failure_weight: Arc::new(default_failure_weight),
            slow_weight: Arc::new(default_slow_weight),
        }
    }
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("sampling_duration", &self.sampling_duration)
            .field("break_duration", &self.break_duration)
            .field("failure_threshold", &self.failure_threshold)
            .field("failure_ratio", &self.failure_ratio)
            .field("success_threshold", &self.success_threshold)
            .field("heartbeat_duration", &self.heartbeat_duration)
            .field("key_idle_ttl", &self.key_idle_ttl)
            .finish_non_exhaustive()
    }
}

impl BreakerConfig {
    /// Set the sampling window; the key idle TTL follows it unless
    /// overridden afterwards.
    pub fn with_sampling_duration(mut self, duration: Duration) -> Self {
        self.sampling_duration = duration;
        self.key_idle_ttl = idle_ttl_for(duration);
        self
    }

    /// Set how long Open persists before probing.
    pub fn with_break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = duration;
        self
    }

    /// Set the weighted failure count required to open.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the failure ratio required to open.
    pub fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    /// Set the weighted successes required to close from Half-Open.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Enable background slow-call sampling while Closed.
    pub fn with_heartbeat_duration(mut self, duration: Duration) -> Self {
        self.heartbeat_duration = duration;
        self
    }

    /// Override the shared-key idle TTL.
    pub fn with_key_idle_ttl(mut self, ttl: Duration) -> Self {
        self.key_idle_ttl = ttl;
        self
    }

    /// Replace the failure weight policy.
    pub fn with_failure_weight(
        mut self,
        weight: impl Fn(&anyhow::Error) -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.failure_weight = Arc::new(weight);
        self
    }

    /// Replace the slow-call weight policy.
    pub fn with_slow_weight(
        mut self,
        weight: impl Fn(Duration) -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.slow_weight = Arc::new(weight);
        self
    }

    /// Validate the configuration. Called once at breaker construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(ConfigError::InvalidRatio(self.failure_ratio));
        }
        if self.sampling_duration.is_zero() {
            return Err(ConfigError::ZeroDuration("sampling_duration"));
        }
        if self.break_duration.is_zero() {
            return Err(ConfigError::ZeroDuration("break_duration"));
        }
        if self.key_idle_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("key_idle_ttl"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("failure_threshold"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("success_threshold"));
        }
        Ok(())
    }
}

fn idle_ttl_for(sampling_duration: Duration) -> Duration {
    sampling_duration
        .saturating_mul(10)
        .max(Duration::from_secs(60))
}

/// Default failure weight: a cancelled call is not evidence against the
/// dependency (0), a blown deadline is strong evidence (5), anything else
/// counts once.
pub fn default_failure_weight(error: &anyhow::Error) -> u32 {
    if error.downcast_ref::<Cancelled>().is_some() {
        0
    } else if error.downcast_ref::<DeadlineExceeded>().is_some()
        || error.downcast_ref::<tokio::time::error::Elapsed>().is_some()
    {
        5
    } else {
        1
    }
}

/// Default slow-call weight: one failure per 5 s of observed latency.
pub fn default_slow_weight(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis() / 5_000).unwrap_or(u32::MAX)
}
