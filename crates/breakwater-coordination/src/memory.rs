//! In-memory coordination backend.
//!
//! Single-process stand-in for the Redis backend: same transition rules,
//! same broadcast ordering, no network. Suitable for tests and for callers
//! that want circuit breaking without a shared store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use breakwater_types::{
    Clock, CommitWeights, Coordination, CoordinationResult, Outcome, Status, StatusSnapshot,
    StatusSubscriber, SystemClock,
};

/// Broadcast buffer per key; a subscriber this far behind is lagging badly
/// and will be resynchronized by the next message it does see.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
struct SharedEntry {
    status: Status,
    failure: u64,
    failure_at_ms: u64,
    success: u64,
    success_at_ms: u64,
    timeout_ms: u64,
    expires_at_ms: u64,
}

impl SharedEntry {
    fn new(status: Status) -> Self {
        Self {
            status,
            failure: 0,
            failure_at_ms: 0,
            success: 0,
            success_at_ms: 0,
            timeout_ms: 0,
            expires_at_ms: 0,
        }
    }

    fn clear_counters(&mut self) {
        self.failure = 0;
        self.failure_at_ms = 0;
        self.success = 0;
        self.success_at_ms = 0;
    }
}

/// Single-process implementation of the [`Coordination`] port.
pub struct MemoryCoordination {
    entries: Arc<DashMap<String, SharedEntry>>,
    channels: Arc<DashMap<String, broadcast::Sender<Status>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Construct with an injected clock; idle-TTL expiry checks use it.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            clock,
        }
    }

    fn sender(&self, key: &str) -> broadcast::Sender<Status> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&self, key: &str, status: Status) {
        // send fails only when nobody is subscribed.
        let _ = self.sender(key).send(status);
        debug!(key = %key, status = %status, "shared transition published");
    }

    /// Drop an entry whose idle TTL has lapsed; returns true when the key
    /// is (now) absent.
    fn expire_if_idle(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at_ms != 0 && now >= entry.expires_at_ms {
                drop(entry);
                self.entries.remove(key);
                return true;
            }
            return false;
        }
        true
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordination for MemoryCoordination {
    async fn begin(&self, key: &str, now_ms: u64) -> CoordinationResult<Status> {
        if self.expire_if_idle(key) {
            return Ok(Status::Closed);
        }
        let mut published = None;
        let status = {
            let mut entry = match self.entries.get_mut(key) {
                Some(entry) => entry,
                None => return Ok(Status::Closed),
            };
            if entry.status == Status::Open && entry.timeout_ms != 0 && now_ms >= entry.timeout_ms
            {
                entry.status = Status::HalfOpen;
                entry.success = 0;
                entry.success_at_ms = 0;
                published = Some(Status::HalfOpen);
            }
            entry.status
        };
        if let Some(status) = published {
            self.publish(key, status);
        }
        Ok(status)
    }

    async fn commit(
        &self,
        key: &str,
        outcome: Outcome,
        weights: &CommitWeights,
    ) -> CoordinationResult<Status> {
        self.expire_if_idle(key);
        let now = weights.now_ms;
        let mut published = None;
        let status = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| SharedEntry::new(Status::Closed));

            match (entry.status, outcome) {
                (Status::Disabled | Status::ForcedOpen | Status::Open, _) => {}
                (Status::Closed, Outcome::Success) => {}
                (Status::Closed, Outcome::Failure) => {
                    let period = weights.failure_period.as_millis() as u64;
                    if entry.failure == 0 || now >= entry.failure_at_ms + period {
                        entry.failure = u64::from(weights.failure_count);
                        entry.failure_at_ms = now;
                    } else {
                        entry.failure += u64::from(weights.failure_count);
                    }
                    if entry.failure >= u64::from(weights.failure_threshold) {
                        entry.status = Status::Open;
                        entry.timeout_ms = weights.open_timeout_ms;
                        entry.clear_counters();
                        published = Some(Status::Open);
                    }
                }
                (Status::HalfOpen, Outcome::Success) => {
                    let period = weights.success_period.as_millis() as u64;
                    if entry.success == 0 || now >= entry.success_at_ms + period {
                        entry.success = u64::from(weights.success_count);
                        entry.success_at_ms = now;
                    } else {
                        entry.success += u64::from(weights.success_count);
                    }
                    if entry.success >= u64::from(weights.success_threshold) {
                        entry.status = Status::Closed;
                        entry.timeout_ms = 0;
                        entry.clear_counters();
                        published = Some(Status::Closed);
                    }
                }
                (Status::HalfOpen, Outcome::Failure) => {
                    entry.status = Status::Open;
                    entry.timeout_ms = weights.open_timeout_ms;
                    entry.clear_counters();
                    published = Some(Status::Open);
                }
            }

            entry.expires_at_ms = self
                .clock
                .now_ms()
                .saturating_add(weights.key_idle_ttl.as_millis() as u64);
            entry.status
        };
        if let Some(status) = published {
            self.publish(key, status);
        }
        Ok(status)
    }

    async fn set_status(
        &self,
        key: &str,
        status: Status,
        ttl: Duration,
    ) -> CoordinationResult<()> {
        {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| SharedEntry::new(status));
            entry.status = status;
            entry.timeout_ms = 0;
            entry.clear_counters();
            entry.expires_at_ms = self
                .clock
                .now_ms()
                .saturating_add(ttl.as_millis() as u64);
        }
        self.publish(key, status);
        Ok(())
    }

    async fn status(&self, key: &str) -> CoordinationResult<Option<StatusSnapshot>> {
        if self.expire_if_idle(key) {
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|entry| StatusSnapshot {
            status: entry.status,
            reset_at_ms: (entry.timeout_ms != 0).then_some(entry.timeout_ms),
        }))
    }

    async fn subscribe(&self, key: &str) -> CoordinationResult<Box<dyn StatusSubscriber>> {
        let receiver = self.sender(key).subscribe();
        Ok(Box::new(MemorySubscriber {
            receiver: Some(receiver),
        }))
    }
}

struct MemorySubscriber {
    receiver: Option<broadcast::Receiver<Status>>,
}

#[async_trait]
impl StatusSubscriber for MemorySubscriber {
    async fn next_status(&mut self) -> CoordinationResult<Option<Status>> {
        let receiver = match self.receiver.as_mut() {
            Some(receiver) => receiver,
            None => return Ok(None),
        };
        loop {
            match receiver.recv().await {
                Ok(status) => return Ok(Some(status)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // The next received status resynchronizes us.
                    warn!(missed = missed, "subscriber lagged behind broadcasts");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn unsubscribe(&mut self) -> CoordinationResult<()> {
        self.receiver = None;
        Ok(())
    }
}
