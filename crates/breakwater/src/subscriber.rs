//! Listener task: applies remote transitions to the local machine.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use breakwater_types::StatusSubscriber;

use crate::breaker::BreakerShared;

/// Backoff after a receive error so a broken stream does not spin.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Spawn the per-breaker listener.
///
/// Messages are processed serially, in arrival order; the breaker's
/// machine lock linearizes them against concurrent local scoring. The task
/// exits when the stop signal fires, when the stream ends, or when the
/// breaker itself is gone.
pub(crate) fn spawn(
    shared: Weak<BreakerShared>,
    mut subscription: Box<dyn StatusSubscriber>,
    mut stop_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    if let Err(e) = subscription.unsubscribe().await {
                        debug!(error = %e, "unsubscribe during stop failed");
                    }
                    break;
                }
                received = subscription.next_status() => match received {
                    Ok(Some(status)) => {
                        let Some(shared) = shared.upgrade() else { break };
                        shared.apply_broadcast(status).await;
                    }
                    Ok(None) => {
                        debug!("subscription stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "subscription receive failed");
                        if shared.strong_count() == 0 {
                            break;
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    })
}
