//! Redis coordination backend.
//!
//! One hash per logical key (the breaker's channel name) with fields
//! `status`, `failure`/`failure_at`, `success`/`success_at` and `timeout`.
//! `begin` and `commit` run as single Lua scripts so the read-modify-write
//! never interleaves with another caller on the same key, and the new status
//! is PUBLISHed from inside the same atomic step. Counter windows are
//! enforced in the scripts: a counter whose window has elapsed resets before
//! it increments, so a burst of old failures cannot hold the state forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use breakwater_types::{
    CommitWeights, Coordination, CoordinationError, CoordinationResult, Outcome, Status,
    StatusSnapshot, StatusSubscriber,
};

/// Reads the current status, auto-transitioning Open to Half-Open once the
/// recorded deadline has passed.
///
/// KEYS[1] = hash key, ARGV[1] = now (epoch ms). Returns the status code.
const BEGIN_SCRIPT: &str = r#"
    local key = KEYS[1]
    local now = tonumber(ARGV[1])

    local status = tonumber(redis.call('HGET', key, 'status'))
    if not status then
        return 1
    end
    if status == 3 then
        local timeout = tonumber(redis.call('HGET', key, 'timeout'))
        if timeout and now >= timeout then
            redis.call('HSET', key, 'status', 2)
            redis.call('HDEL', key, 'success', 'success_at')
            redis.call('PUBLISH', key, 'half_open')
            return 2
        end
    end
    return status
"#;

/// Applies one scoring outcome.
///
/// KEYS[1] = hash key. ARGV: outcome, now, failure_count, failure_threshold,
/// failure_period_ms, success_count, success_threshold, success_period_ms,
/// open_timeout_ms, idle_ttl_ms. Returns the post-commit status code.
const COMMIT_SCRIPT: &str = r#"
    local key = KEYS[1]
    local outcome = ARGV[1]
    local now = tonumber(ARGV[2])
    local failure_count = tonumber(ARGV[3])
    local failure_threshold = tonumber(ARGV[4])
    local failure_period = tonumber(ARGV[5])
    local success_count = tonumber(ARGV[6])
    local success_threshold = tonumber(ARGV[7])
    local success_period = tonumber(ARGV[8])
    local open_timeout = tonumber(ARGV[9])
    local idle_ttl = tonumber(ARGV[10])

    local status = tonumber(redis.call('HGET', key, 'status')) or 1

    if status == 4 or status == 5 then
        return status
    end

    if status == 1 and outcome == 'failure' then
        local window = tonumber(redis.call('HGET', key, 'failure_at'))
        local failures
        if window and now < window + failure_period then
            failures = redis.call('HINCRBY', key, 'failure', failure_count)
        else
            redis.call('HSET', key, 'failure', failure_count, 'failure_at', now)
            failures = failure_count
        end
        if failures >= failure_threshold then
            status = 3
            redis.call('HSET', key, 'status', 3, 'timeout', open_timeout)
            redis.call('HDEL', key, 'failure', 'failure_at', 'success', 'success_at')
            redis.call('PUBLISH', key, 'open')
        else
            redis.call('HSET', key, 'status', 1)
        end
    elseif status == 2 and outcome == 'success' then
        local window = tonumber(redis.call('HGET', key, 'success_at'))
        local successes
        if window and now < window + success_period then
            successes = redis.call('HINCRBY', key, 'success', success_count)
        else
            redis.call('HSET', key, 'success', success_count, 'success_at', now)
            successes = success_count
        end
        if successes >= success_threshold then
            status = 1
            redis.call('HSET', key, 'status', 1)
            redis.call('HDEL', key, 'failure', 'failure_at', 'success', 'success_at', 'timeout')
            redis.call('PUBLISH', key, 'closed')
        end
    elseif status == 2 and outcome == 'failure' then
        status = 3
        redis.call('HSET', key, 'status', 3, 'timeout', open_timeout)
        redis.call('HDEL', key, 'failure', 'failure_at', 'success', 'success_at')
        redis.call('PUBLISH', key, 'open')
    end

    redis.call('PEXPIRE', key, idle_ttl)
    return status
"#;

/// Administrative override: store, refresh TTL, broadcast.
///
/// KEYS[1] = hash key. ARGV: status code, status name, idle_ttl_ms.
const SET_STATUS_SCRIPT: &str = r#"
    local key = KEYS[1]
    redis.call('HSET', key, 'status', ARGV[1])
    redis.call('HDEL', key, 'failure', 'failure_at', 'success', 'success_at', 'timeout')
    redis.call('PEXPIRE', key, ARGV[3])
    redis.call('PUBLISH', key, ARGV[2])
"#;

/// Redis implementation of the [`Coordination`] port.
pub struct RedisCoordination {
    conn: Arc<Mutex<MultiplexedConnection>>,
    client: Arc<Client>,
}

impl RedisCoordination {
    /// Connect to Redis, e.g. `redis://localhost:6379`.
    pub async fn connect(redis_url: &str) -> CoordinationResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;

        info!("redis coordination connected");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl Coordination for RedisCoordination {
    #[instrument(skip(self), fields(key = %key))]
    async fn begin(&self, key: &str, now_ms: u64) -> CoordinationResult<Status> {
        let mut conn = self.conn.lock().await;
        let code: u8 = Script::new(BEGIN_SCRIPT)
            .key(key)
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await?;
        decode_status(code)
    }

    #[instrument(skip(self, weights), fields(key = %key, outcome = ?outcome))]
    async fn commit(
        &self,
        key: &str,
        outcome: Outcome,
        weights: &CommitWeights,
    ) -> CoordinationResult<Status> {
        let outcome_arg = match outcome {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        };
        let mut conn = self.conn.lock().await;
        let code: u8 = Script::new(COMMIT_SCRIPT)
            .key(key)
            .arg(outcome_arg)
            .arg(weights.now_ms)
            .arg(weights.failure_count)
            .arg(weights.failure_threshold)
            .arg(weights.failure_period.as_millis() as u64)
            .arg(weights.success_count)
            .arg(weights.success_threshold)
            .arg(weights.success_period.as_millis() as u64)
            .arg(weights.open_timeout_ms)
            .arg(weights.key_idle_ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;
        let status = decode_status(code)?;
        debug!(status = %status, "commit applied");
        Ok(status)
    }

    #[instrument(skip(self), fields(key = %key, status = %status))]
    async fn set_status(
        &self,
        key: &str,
        status: Status,
        ttl: Duration,
    ) -> CoordinationResult<()> {
        let mut conn = self.conn.lock().await;
        let _: () = Script::new(SET_STATUS_SCRIPT)
            .key(key)
            .arg(status.code())
            .arg(status.name())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;
        info!("administrative status stored");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn status(&self, key: &str) -> CoordinationResult<Option<StatusSnapshot>> {
        let mut conn = self.conn.lock().await;
        let (code, timeout): (Option<u8>, Option<u64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("status")
            .arg("timeout")
            .query_async(&mut *conn)
            .await?;

        match code {
            Some(code) => Ok(Some(StatusSnapshot {
                status: decode_status(code)?,
                reset_at_ms: timeout.filter(|&t| t != 0),
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn subscribe(&self, key: &str) -> CoordinationResult<Box<dyn StatusSubscriber>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(key).await?;

        debug!("subscription created");
        Ok(Box::new(RedisSubscriber {
            pubsub: Some(pubsub),
            channel: key.to_string(),
        }))
    }
}

fn decode_status(code: u8) -> CoordinationResult<Status> {
    Status::from_code(code)
        .ok_or_else(|| CoordinationError::protocol(format!("unknown status code {code}")))
}

struct RedisSubscriber {
    pubsub: Option<PubSub>,
    channel: String,
}

#[async_trait]
impl StatusSubscriber for RedisSubscriber {
    async fn next_status(&mut self) -> CoordinationResult<Option<Status>> {
        let pubsub = match self.pubsub.as_mut() {
            Some(pubsub) => pubsub,
            None => return Ok(None),
        };
        let mut stream = pubsub.on_message();
        loop {
            let message = match stream.next().await {
                Some(message) => message,
                None => return Ok(None),
            };
            let payload: String = message.get_payload()?;
            match payload.parse::<Status>() {
                Ok(status) => return Ok(Some(status)),
                Err(e) => {
                    // Skip foreign traffic on the channel rather than
                    // tearing the subscription down.
                    warn!(channel = %self.channel, error = %e, "ignoring unparseable payload");
                }
            }
        }
    }

    async fn unsubscribe(&mut self) -> CoordinationResult<()> {
        if let Some(mut pubsub) = self.pubsub.take() {
            pubsub.unsubscribe(&self.channel).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_publish_every_transition() {
        // Each transition site in the scripts carries its broadcast; a
        // commit that changes state without informing peers would strand
        // them until their own evidence accumulates.
        for script in [BEGIN_SCRIPT, COMMIT_SCRIPT, SET_STATUS_SCRIPT] {
            assert!(script.contains("PUBLISH"));
        }
        assert_eq!(COMMIT_SCRIPT.matches("PUBLISH").count(), 3);
    }

    #[test]
    fn script_payloads_parse_as_statuses() {
        for payload in ["half_open", "open", "closed"] {
            assert!(payload.parse::<Status>().is_ok());
        }
    }
}
