//! Idle session sweeper.
//!
//! Periodically drops per-session lock/semaphore pairs that have been idle
//! longer than the configured TTL, so that a long-lived daemon does not
//! accumulate one entry for every session it has ever seen.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session_queue::SessionQueue;

/// Spawn the idle-session sweep background task.
///
/// The task sweeps every `interval` until the `CancellationToken` fires.
#[must_use]
pub fn spawn_session_sweeper(
    queue: Arc<SessionQueue>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; nothing is idle yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("session sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = queue.sweep_idle(ttl);
                    if removed > 0 {
                        info!(removed, remaining = queue.session_count(), "evicted idle sessions");
                    } else {
                        debug!(remaining = queue.session_count(), "no idle sessions to evict");
                    }
                }
            }
        }
    })
}
