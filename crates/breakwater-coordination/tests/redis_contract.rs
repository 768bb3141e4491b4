//! Contract tests against a real Redis.
//!
//! These need Docker and are ignored by default:
//! `cargo test -p breakwater-coordination -- --ignored`

use std::time::Duration;

use testcontainers::clients::Cli;
use testcontainers_modules::redis::Redis as RedisImage;

use breakwater_coordination::RedisCoordination;
use breakwater_types::{CommitWeights, Coordination, Outcome, Status};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn coordination_for(docker: &Cli) -> (RedisCoordination, testcontainers::Container<'_, RedisImage>) {
    init_tracing();
    let container = docker.run(RedisImage);
    let url = format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379));
    let coordination = RedisCoordination::connect(&url)
        .await
        .expect("redis should accept connections");
    (coordination, container)
}

fn weights(now_ms: u64) -> CommitWeights {
    CommitWeights {
        now_ms,
        failure_count: 1,
        failure_threshold: 3,
        failure_period: Duration::from_secs(10),
        success_count: 1,
        success_threshold: 2,
        success_period: Duration::from_secs(10),
        open_timeout_ms: now_ms + 5_000,
        key_idle_ttl: Duration::from_secs(60),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn scripted_transition_cycle() {
    let docker = Cli::default();
    let (coordination, _container) = coordination_for(&docker).await;
    let key = "contract:orders";

    // Fresh key reads closed and has no snapshot.
    assert_eq!(coordination.begin(key, 0).await.unwrap(), Status::Closed);
    assert!(coordination.status(key).await.unwrap().is_none());

    // Threshold failures open the circuit.
    for _ in 0..2 {
        assert_eq!(
            coordination
                .commit(key, Outcome::Failure, &weights(1_000))
                .await
                .unwrap(),
            Status::Closed
        );
    }
    assert_eq!(
        coordination
            .commit(key, Outcome::Failure, &weights(1_000))
            .await
            .unwrap(),
        Status::Open
    );
    let snapshot = coordination.status(key).await.unwrap().unwrap();
    assert_eq!(snapshot.status, Status::Open);
    assert_eq!(snapshot.reset_at_ms, Some(6_000));

    // The deadline flips it to half-open, then successes close it.
    assert_eq!(coordination.begin(key, 6_000).await.unwrap(), Status::HalfOpen);
    assert_eq!(
        coordination
            .commit(key, Outcome::Success, &weights(6_000))
            .await
            .unwrap(),
        Status::HalfOpen
    );
    assert_eq!(
        coordination
            .commit(key, Outcome::Success, &weights(6_000))
            .await
            .unwrap(),
        Status::Closed
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn broadcasts_reach_subscribers_in_order() {
    let docker = Cli::default();
    let (coordination, _container) = coordination_for(&docker).await;
    let key = "contract:payments";

    let mut subscriber = coordination.subscribe(key).await.unwrap();

    for _ in 0..3 {
        coordination
            .commit(key, Outcome::Failure, &weights(0))
            .await
            .unwrap();
    }
    coordination.begin(key, 10_000).await.unwrap();
    coordination
        .set_status(key, Status::Disabled, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(subscriber.next_status().await.unwrap(), Some(Status::Open));
    assert_eq!(
        subscriber.next_status().await.unwrap(),
        Some(Status::HalfOpen)
    );
    assert_eq!(
        subscriber.next_status().await.unwrap(),
        Some(Status::Disabled)
    );

    subscriber.unsubscribe().await.unwrap();
    assert_eq!(subscriber.next_status().await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn administrative_status_blocks_commits() {
    let docker = Cli::default();
    let (coordination, _container) = coordination_for(&docker).await;
    let key = "contract:search";

    coordination
        .set_status(key, Status::ForcedOpen, Duration::from_secs(60))
        .await
        .unwrap();

    for _ in 0..5 {
        assert_eq!(
            coordination
                .commit(key, Outcome::Failure, &weights(0))
                .await
                .unwrap(),
            Status::ForcedOpen
        );
    }
    assert_eq!(coordination.begin(key, 99_000).await.unwrap(), Status::ForcedOpen);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn stale_counter_window_resets() {
    let docker = Cli::default();
    let (coordination, _container) = coordination_for(&docker).await;
    let key = "contract:inventory";

    coordination
        .commit(key, Outcome::Failure, &weights(0))
        .await
        .unwrap();
    coordination
        .commit(key, Outcome::Failure, &weights(0))
        .await
        .unwrap();

    // Both earlier failures fall outside the window; the counter restarts.
    let late = weights(60_000);
    coordination
        .commit(key, Outcome::Failure, &late)
        .await
        .unwrap();
    assert_eq!(
        coordination
            .commit(key, Outcome::Failure, &late)
            .await
            .unwrap(),
        Status::Closed
    );
}
