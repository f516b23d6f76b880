//! Per-session serialization queue with admission control and deadlines.
//!
//! Each session id owns one async mutex and one semaphore, created lazily.
//! A request first takes a semaphore permit without waiting (admission),
//! then waits for the session mutex (serialization), then relays the
//! agent's chunks under a deadline fixed at lock acquisition.
//!
//! The agent call runs as a spawned task that feeds an internal `mpsc`
//! relay. The deadline is computed once and never extended per chunk, so a
//! steady trickle of small chunks cannot keep a pass alive forever.
//!
//! The permit, the mutex guard, and the worker handle live inside the
//! reply stream. Whatever way the stream ends (completion, timeout, error,
//! or the caller dropping it early) they are released exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::{Agent, AgentRequest};
use crate::config::QueueConfig;

/// Chunk emitted when a session already has `max_per_session` outstanding requests.
pub const QUEUE_FULL_MESSAGE: &str = "⚠️ Queue full. Please try again in a moment.";

/// Prefix of the chunk emitted when the agent call raised.
pub const ERROR_MESSAGE_PREFIX: &str = "Sorry, I encountered an error.";

/// Smallest wait used near the deadline, to avoid a busy spin.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Capacity of the internal relay between the agent worker and the caller.
const RELAY_CAPACITY: usize = 64;

/// Caller-facing reply stream. Always terminates.
pub type ReplyStream = std::pin::Pin<Box<dyn Stream<Item = String> + Send>>;

/// Text of the chunk emitted when a pass exceeds its deadline.
#[must_use]
pub fn timeout_message(timeout: Duration) -> String {
    format!("⚠️ Request timed out after {}s.", timeout.as_secs())
}

/// Text of the chunk emitted when the agent call failed.
#[must_use]
pub fn error_message(detail: &str) -> String {
    let detail = detail.trim();
    let detail = if detail.is_empty() { "Unknown error" } else { detail };
    format!("{ERROR_MESSAGE_PREFIX} {detail}")
}

/// Point-in-time view of one session's queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Admission permits currently free.
    pub available_permits: usize,
    /// Whether a processing pass currently holds the session lock.
    pub busy: bool,
}

struct SessionSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    permits: Arc<Semaphore>,
    last_used: Mutex<Instant>,
}

impl SessionSlot {
    fn new(max_per_session: usize) -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            permits: Arc::new(Semaphore::new(max_per_session)),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

enum Relay {
    Chunk(String),
    Failed(String),
}

/// Aborts the agent worker if the reply stream is dropped mid-pass.
struct WorkerGuard(Option<JoinHandle<()>>);

impl WorkerGuard {
    /// Whether the worker has returned, leaving only buffered chunks.
    fn is_finished(&self) -> bool {
        self.0.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Abort the worker and wait until it has fully unwound.
    async fn cancel_and_wait(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Wait for a worker whose relay already closed; reports a panic.
    async fn join(&mut self) -> Option<String> {
        let handle = self.0.take()?;
        match handle.await {
            Ok(()) => None,
            Err(err) if err.is_panic() => Some("agent task panicked".to_owned()),
            Err(_) => None,
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Per-session serialization queue in front of an [`Agent`].
pub struct SessionQueue {
    agent: Arc<dyn Agent>,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    max_per_session: usize,
    process_message_timeout: Duration,
}

impl SessionQueue {
    /// Create a queue admitting up to `max_per_session` outstanding
    /// requests per session, each pass bounded by `process_message_timeout`.
    #[must_use]
    pub fn new(
        agent: Arc<dyn Agent>,
        max_per_session: usize,
        process_message_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            sessions: Mutex::new(HashMap::new()),
            max_per_session,
            process_message_timeout,
        }
    }

    /// Create a queue from the `[queue]` config section.
    #[must_use]
    pub fn from_config(agent: Arc<dyn Agent>, config: &QueueConfig) -> Self {
        Self::new(agent, config.max_per_session, config.process_message_timeout())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        let mut sessions = self.lock_sessions();
        let slot = sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(SessionSlot::new(self.max_per_session)));
        slot.touch();
        Arc::clone(slot)
    }

    /// Process one message for `session_id` and stream the reply.
    ///
    /// The returned stream yields a single queue-full chunk when the
    /// session is at capacity, otherwise the agent's chunks, followed by at
    /// most one timeout or error chunk. It never yields an error and always
    /// terminates. Admission happens on the first poll.
    #[must_use]
    pub fn process_message(&self, session_id: &str, request: AgentRequest) -> ReplyStream {
        let slot = self.slot(session_id);
        let agent = Arc::clone(&self.agent);
        let timeout = self.process_message_timeout;
        let max_per_session = self.max_per_session;
        let span = info_span!("process_message", session_id, user_id = %request.user_id);
        let session_id = session_id.to_owned();

        let replies = async_stream::stream! {
            let Ok(_permit) = Arc::clone(&slot.permits).try_acquire_owned() else {
                warn!(session_id, max = max_per_session, "queue full");
                yield QUEUE_FULL_MESSAGE.to_owned();
                return;
            };

            let _session_guard = Arc::clone(&slot.lock).lock_owned().await;
            slot.touch();
            let deadline = Instant::now() + timeout;
            debug!(session_id, "session lock acquired");

            let (tx, mut rx) = mpsc::channel(RELAY_CAPACITY);
            let mut worker = WorkerGuard(Some(tokio::spawn(
                relay_agent(agent, request, tx).instrument(span),
            )));

            loop {
                let now = Instant::now();
                // A finished worker has dropped its sender, so `recv` only
                // drains what is buffered; the deadline no longer applies.
                let next = if worker.is_finished() {
                    Ok(rx.recv().await)
                } else if now >= deadline {
                    worker.cancel_and_wait().await;
                    info!(session_id, timeout_secs = timeout.as_secs(), "processing pass timed out");
                    yield timeout_message(timeout);
                    break;
                } else {
                    tokio::time::timeout((deadline - now).max(MIN_WAIT), rx.recv()).await
                };

                match next {
                    Ok(Some(Relay::Chunk(chunk))) => yield chunk,
                    Ok(Some(Relay::Failed(detail))) => {
                        worker.join().await;
                        yield error_message(&detail);
                        break;
                    }
                    Ok(None) => {
                        if let Some(detail) = worker.join().await {
                            error!(session_id, "{detail}");
                            yield error_message(&detail);
                        }
                        break;
                    }
                    Err(_elapsed) if worker.is_finished() => continue,
                    Err(_elapsed) => {
                        worker.cancel_and_wait().await;
                        info!(session_id, timeout_secs = timeout.as_secs(), "processing pass timed out");
                        yield timeout_message(timeout);
                        break;
                    }
                }
            }

            slot.touch();
            debug!(session_id, "session lock released");
        };

        Box::pin(replies)
    }

    /// Number of sessions with a live lock/semaphore pair.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Current admission and lock state for a known session.
    #[must_use]
    pub fn session_stats(&self, session_id: &str) -> Option<SessionStats> {
        let sessions = self.lock_sessions();
        sessions.get(session_id).map(|slot| SessionStats {
            available_permits: slot.permits.available_permits(),
            busy: slot.lock.try_lock().is_err(),
        })
    }

    /// Drop sessions idle for at least `ttl` that hold no permits, no lock,
    /// and are not referenced by any live reply stream. Returns how many
    /// were removed.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.lock_sessions();
        let before = sessions.len();
        sessions.retain(|_, slot| {
            let unused = Arc::strong_count(slot) == 1
                && slot.permits.available_permits() == self.max_per_session
                && slot.lock.try_lock().is_ok();
            !(unused && slot.idle_for() >= ttl)
        });
        before - sessions.len()
    }
}

/// Drive the agent stream into the relay until it ends, fails, or the
/// receiver goes away.
async fn relay_agent(agent: Arc<dyn Agent>, request: AgentRequest, tx: mpsc::Sender<Relay>) {
    let mut chunks = agent.process_message(request);
    while let Some(item) = chunks.next().await {
        let message = match item {
            Ok(chunk) => Relay::Chunk(chunk),
            Err(err) => {
                warn!(%err, "agent call failed");
                let _ = tx.send(Relay::Failed(err.to_string())).await;
                return;
            }
        };
        if tx.send(message).await.is_err() {
            return;
        }
    }
}
