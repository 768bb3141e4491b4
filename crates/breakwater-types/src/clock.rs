//! Clock abstraction for testability.

/// Monotonic-enough time source; all duration arithmetic routes through it.
///
/// The shared hash stores deadlines as epoch milliseconds, so the clock
/// speaks epoch milliseconds too. Tests inject a deterministic source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock implementation.
#[derive(Default, Debug)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|e| {
                tracing::error!("system time is before the Unix epoch: {}", e);
                std::time::Duration::from_secs(0)
            });

        // as_millis is u128; saturate rather than wrap on absurd clocks.
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_past_2020() {
        let clock = SystemClock;
        assert!(clock.now_ms() > 1_577_836_800_000);
    }
}
