//! Sub-agent event consumer. Records [`SubagentEvent`]s in the log.
//!
//! Reads events from the runner's `mpsc` channel until the channel closes
//! or the `CancellationToken` fires. Events already queued when the token
//! fires are still logged.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::subagent_runner::SubagentEvent;

/// Spawn a background task that logs every sub-agent lifecycle event.
///
/// The task resolves to the number of events it logged.
#[must_use]
pub fn spawn_subagent_event_logger(
    mut rx: mpsc::Receiver<SubagentEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut logged = 0;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        log_event(&event);
                        logged += 1;
                    }
                    info!(logged, "sub-agent event logger shutting down");
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(e) = maybe_event { e } else {
                        info!("sub-agent event channel closed");
                        break;
                    }
                }
            };
            log_event(&event);
            logged += 1;
        }
        logged
    })
}

fn log_event(event: &SubagentEvent) {
    match event {
        SubagentEvent::Started {
            run_id,
            label,
            task_summary,
            spawn_depth,
        } => info!(run_id, label, task_summary, spawn_depth, "sub-agent started"),
        SubagentEvent::Completed {
            run_id,
            label,
            result_preview,
        } => info!(
            run_id,
            label,
            preview_chars = result_preview.chars().count(),
            "sub-agent completed"
        ),
        SubagentEvent::Failed {
            run_id,
            label,
            error,
        } => warn!(run_id, label, error, "sub-agent failed"),
        SubagentEvent::TimedOut { run_id, label } => warn!(run_id, label, "sub-agent timed out"),
        SubagentEvent::Cancelled { run_id, label } => info!(run_id, label, "sub-agent cancelled"),
    }
}
