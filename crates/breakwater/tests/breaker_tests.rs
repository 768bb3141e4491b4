//! End-to-end breaker scenarios against the in-memory coordinator.
//!
//! Time is fully deterministic: tokio's paused clock drives timers and a
//! mock epoch clock drives decay and shared deadlines; tests advance both
//! together.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use breakwater::{
    Breaker, BreakerConfig, BreakerError, Cancelled, Clock, CommitWeights, Coordination,
    CoordinationError, CoordinationResult, DeadlineExceeded, Outcome, Status, StatusSnapshot,
    StatusSubscriber,
};
use breakwater_coordination::MemoryCoordination;

#[derive(Debug, Default)]
struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Capture transition logs in test output; `RUST_LOG` tunes verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    coordination: Arc<MemoryCoordination>,
    clock: Arc<TestClock>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let clock = Arc::new(TestClock::default());
        Self {
            coordination: Arc::new(MemoryCoordination::with_clock(clock.clone())),
            clock,
        }
    }

    async fn breaker(&self, channel: &str, config: BreakerConfig) -> Breaker {
        Breaker::connect_with_clock(
            self.coordination.clone(),
            channel,
            config,
            self.clock.clone(),
        )
        .await
        .expect("breaker should connect against the memory coordinator")
    }

    /// Advance the mock clock and tokio's paused clock together, then let
    /// spawned tasks (timers, probes, listeners) run.
    async fn advance(&self, ms: u64) {
        self.clock.advance(ms);
        tokio::time::advance(Duration::from_millis(ms)).await;
        settle().await;
    }
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn fast_config() -> BreakerConfig {
    BreakerConfig::default().with_sampling_duration(Duration::from_secs(1))
}

fn fail() -> Result<(), anyhow::Error> {
    Err(anyhow::anyhow!("dependency down"))
}

async fn drive_open(breaker: &Breaker) {
    for _ in 0..10 {
        let err = breaker.execute(|| async { fail() }).await.unwrap_err();
        assert_eq!(err.to_string(), "dependency down");
    }
    settle().await;
    assert_eq!(breaker.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn opens_on_repeated_failure_and_short_circuits() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", fast_config()).await;

    drive_open(&breaker).await;

    let invoked = Arc::new(AtomicUsize::new(0));
    let observed = invoked.clone();
    let err = breaker
        .execute(|| async move {
            observed.fetch_add(1, Ordering::SeqCst);
            fail()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BreakerError::Unavailable));
    assert_eq!(invoked.load(Ordering::SeqCst), 0, "open gate must not invoke op");
}

#[tokio::test(start_paused = true)]
async fn auto_probes_half_open_after_break_duration() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", fast_config()).await;
    drive_open(&breaker).await;

    harness.advance(5_001).await;
    assert_eq!(breaker.status(), Status::HalfOpen);

    let invoked = Arc::new(AtomicUsize::new(0));
    let observed = invoked.clone();
    let result = breaker
        .execute(|| async move {
            observed.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.status(), Status::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn closes_after_success_threshold_in_half_open() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", fast_config()).await;
    drive_open(&breaker).await;
    harness.advance(5_001).await;

    // One probe success from the half-open entry...
    breaker
        .execute(|| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap();
    // ...then success_threshold more close the circuit.
    for _ in 0..5 {
        breaker
            .execute(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
    }
    settle().await;
    assert_eq!(breaker.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn half_open_single_failure_reopens() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", fast_config()).await;
    drive_open(&breaker).await;
    harness.advance(5_001).await;
    assert_eq!(breaker.status(), Status::HalfOpen);

    let err = breaker.execute(|| async { fail() }).await.unwrap_err();
    assert_eq!(err.to_string(), "dependency down");
    settle().await;
    assert_eq!(breaker.status(), Status::Open);

    // The re-armed reset timer probes again after another break duration.
    harness.advance(5_001).await;
    assert_eq!(breaker.status(), Status::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn slow_call_opens_despite_success() {
    let harness = Harness::new();
    let config = BreakerConfig::default().with_slow_weight(|_| 10);
    let breaker = harness.breaker("orders", config).await;

    let result = breaker
        .execute(|| async { Ok::<_, anyhow::Error>("fine") })
        .await;
    assert_eq!(result.unwrap(), "fine");
    settle().await;
    assert_eq!(breaker.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn open_propagates_across_instances() {
    let harness = Harness::new();
    let a = harness.breaker("orders", fast_config()).await;
    let b = harness.breaker("orders", fast_config()).await;

    drive_open(&a).await;
    settle().await;

    assert_eq!(a.status(), Status::Open);
    assert_eq!(b.status(), Status::Open);

    let invoked = Arc::new(AtomicUsize::new(0));
    let observed = invoked.clone();
    let err = b
        .execute(|| async move {
            observed.fetch_add(1, Ordering::SeqCst);
            fail()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BreakerError::Unavailable));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn force_open_rejects_regardless_of_op() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", BreakerConfig::default()).await;

    breaker.force_open().await.unwrap();
    assert_eq!(breaker.status(), Status::ForcedOpen);

    let err = breaker
        .execute(|| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, BreakerError::ForcedOpen));
}

#[tokio::test(start_paused = true)]
async fn force_open_reaches_peers() {
    let harness = Harness::new();
    let a = harness.breaker("orders", BreakerConfig::default()).await;
    let b = harness.breaker("orders", BreakerConfig::default()).await;

    a.force_open().await.unwrap();
    settle().await;
    assert_eq!(b.status(), Status::ForcedOpen);

    // A peer's scored broadcast must not clear the administrative state;
    // only the explicit reset does.
    a.reset().await.unwrap();
    settle().await;
    assert_eq!(a.status(), Status::Closed);
    assert_eq!(b.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn disable_bypasses_scoring() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", fast_config()).await;

    breaker.disable().await.unwrap();
    for _ in 0..11 {
        let err = breaker.execute(|| async { fail() }).await.unwrap_err();
        assert_eq!(err.to_string(), "dependency down");
    }
    assert_eq!(breaker.status(), Status::Disabled);
}

#[tokio::test(start_paused = true)]
async fn cancelled_operations_never_count() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", fast_config()).await;

    for _ in 0..50 {
        let err = breaker
            .execute(|| async { Err::<(), _>(anyhow::Error::new(Cancelled)) })
            .await
            .unwrap_err();
        assert!(err.operation_error().is_some());
    }
    assert_eq!(breaker.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn deadline_exceeded_weighs_five() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", fast_config()).await;

    // Two blown deadlines carry the full default failure threshold.
    for _ in 0..2 {
        breaker
            .execute(|| async { Err::<(), _>(anyhow::Error::new(DeadlineExceeded)) })
            .await
            .unwrap_err();
    }
    settle().await;
    assert_eq!(breaker.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_opens_during_a_slow_call() {
    let harness = Harness::new();
    let config = BreakerConfig::default()
        .with_heartbeat_duration(Duration::from_secs(1))
        .with_slow_weight(|_| 10);
    let breaker = harness.breaker("orders", config).await;

    // The op itself would succeed after 3 s, but the heartbeat samples the
    // elapsed wait and opens the circuit before it returns.
    let result = breaker
        .execute(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok::<_, anyhow::Error>(())
        })
        .await;
    assert!(result.is_ok());
    settle().await;
    assert_eq!(breaker.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn stop_terminates_the_breaker() {
    let harness = Harness::new();
    let breaker = harness.breaker("orders", BreakerConfig::default()).await;

    breaker.stop().await;
    breaker.stop().await;

    let err = breaker
        .execute(|| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, BreakerError::Terminated));
    assert!(matches!(
        breaker.force_open().await.unwrap_err(),
        BreakerError::Terminated
    ));
}

#[tokio::test(start_paused = true)]
async fn stopped_peer_ignores_broadcasts() {
    let harness = Harness::new();
    let a = harness.breaker("orders", fast_config()).await;
    let b = harness.breaker("orders", fast_config()).await;

    b.stop().await;
    drive_open(&a).await;
    settle().await;

    assert_eq!(a.status(), Status::Open);
    assert_eq!(b.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn exactly_one_shared_open_transition_under_contention() {
    let harness = Harness::new();
    let config = fast_config().with_failure_threshold(8);
    let breaker = Arc::new(harness.breaker("orders", config).await);

    let mut observer = harness.coordination.subscribe("orders").await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let breaker = breaker.clone();
        tasks.push(tokio::spawn(async move {
            breaker
                .execute(|| async {
                    tokio::task::yield_now().await;
                    fail()
                })
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }
    settle().await;
    assert_eq!(breaker.status(), Status::Open);

    let mut opens = 0;
    while let Ok(Ok(Some(status))) =
        tokio::time::timeout(Duration::from_millis(20), observer.next_status()).await
    {
        if status == Status::Open {
            opens += 1;
        }
    }
    assert_eq!(opens, 1, "concurrent crossings must collapse to one shared transition");
}

#[tokio::test(start_paused = true)]
async fn late_joiner_adopts_the_shared_state() {
    let harness = Harness::new();
    let a = harness.breaker("orders", fast_config()).await;
    drive_open(&a).await;

    // A breaker connecting after the fact seeds from the shared snapshot.
    let b = harness.breaker("orders", fast_config()).await;
    assert_eq!(b.status(), Status::Open);

    // And its adopted deadline probes on the original schedule.
    harness.advance(5_001).await;
    assert_eq!(b.status(), Status::HalfOpen);
}

/// A coordinator whose store is unreachable: writes fail, reads see
/// nothing, the subscription stream stays silent.
struct DownCoordination;

struct SilentSubscriber;

#[async_trait]
impl StatusSubscriber for SilentSubscriber {
    async fn next_status(&mut self) -> CoordinationResult<Option<Status>> {
        std::future::pending().await
    }

    async fn unsubscribe(&mut self) -> CoordinationResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Coordination for DownCoordination {
    async fn begin(&self, _key: &str, _now_ms: u64) -> CoordinationResult<Status> {
        Err(CoordinationError::backend("coordinator offline"))
    }

    async fn commit(
        &self,
        _key: &str,
        _outcome: Outcome,
        _weights: &CommitWeights,
    ) -> CoordinationResult<Status> {
        Err(CoordinationError::backend("coordinator offline"))
    }

    async fn set_status(
        &self,
        _key: &str,
        _status: Status,
        _ttl: Duration,
    ) -> CoordinationResult<()> {
        Err(CoordinationError::backend("coordinator offline"))
    }

    async fn status(&self, _key: &str) -> CoordinationResult<Option<StatusSnapshot>> {
        Ok(None)
    }

    async fn subscribe(&self, _key: &str) -> CoordinationResult<Box<dyn StatusSubscriber>> {
        Ok(Box::new(SilentSubscriber))
    }
}

#[tokio::test(start_paused = true)]
async fn commit_failure_is_joined_and_local_state_still_flips() {
    let clock = Arc::new(TestClock::default());
    let breaker = Breaker::connect_with_clock(
        Arc::new(DownCoordination),
        "orders",
        fast_config(),
        clock,
    )
    .await
    .unwrap();

    for _ in 0..9 {
        let err = breaker.execute(|| async { fail() }).await.unwrap_err();
        assert!(err.coordination_error().is_none());
    }
    // The crossing call carries both the op error and the failed commit.
    let err = breaker.execute(|| async { fail() }).await.unwrap_err();
    assert_eq!(err.to_string(), "dependency down");
    assert!(err.operation_error().is_some());
    assert!(err.coordination_error().is_some());

    // The local flip stands even though the commit never landed.
    assert_eq!(breaker.status(), Status::Open);
    let err = breaker.execute(|| async { fail() }).await.unwrap_err();
    assert!(matches!(err, BreakerError::Unavailable));
}

#[tokio::test(start_paused = true)]
async fn publish_failure_surfaces_even_when_op_succeeds() {
    let clock = Arc::new(TestClock::default());
    let config = BreakerConfig::default().with_slow_weight(|_| 10);
    let breaker =
        Breaker::connect_with_clock(Arc::new(DownCoordination), "orders", config, clock)
            .await
            .unwrap();

    let err = breaker
        .execute(|| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, BreakerError::Coordination(_)));
    assert_eq!(breaker.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn probe_degrades_to_local_half_open_when_coordinator_is_down() {
    let clock = Arc::new(TestClock::default());
    let breaker = Breaker::connect_with_clock(
        Arc::new(DownCoordination),
        "orders",
        fast_config(),
        clock.clone(),
    )
    .await
    .unwrap();

    for _ in 0..10 {
        breaker.execute(|| async { fail() }).await.unwrap_err();
    }
    assert_eq!(breaker.status(), Status::Open);

    clock.advance(5_001);
    tokio::time::advance(Duration::from_millis(5_001)).await;
    settle().await;
    assert_eq!(breaker.status(), Status::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn empty_channel_is_rejected_at_construction() {
    let harness = Harness::new();
    let result = Breaker::connect_with_clock(
        harness.coordination.clone(),
        "",
        BreakerConfig::default(),
        harness.clock.clone(),
    )
    .await;
    assert!(result.is_err());
}
