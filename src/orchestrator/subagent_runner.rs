//! Background execution of sub-agent runs.
//!
//! [`SubagentRunner::spawn`] enforces the depth and fan-out policy against
//! the registry's counts, registers the run, and executes it on a tracked
//! tokio task. The task relays the agent's chunks into a result buffer and
//! checks for cancellation at every chunk boundary; the registry's flag is
//! advisory, so a run stops at the next boundary rather than immediately.
//!
//! Outcomes are recorded in the registry and announced on an optional
//! [`SubagentEvent`] channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};

use crate::agent::{Agent, AgentRequest, MessageOptions};
use crate::config::SubagentConfig;
use crate::models::subagent::{NewRun, SubagentRun};
use crate::models::truncate_chars;
use crate::{AppError, Result};

use super::subagent_registry::SubagentRegistry;

/// Longest result excerpt carried by [`SubagentEvent::Completed`].
const RESULT_PREVIEW_CHARS: usize = 500;

/// Lifecycle notifications for observers (status surfaces, logs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubagentEvent {
    /// A run was registered and started.
    Started {
        /// Run identifier.
        run_id: String,
        /// Display label.
        label: String,
        /// First line of the task.
        task_summary: String,
        /// Spawn depth of the new run.
        spawn_depth: u32,
    },
    /// A run produced its result.
    Completed {
        /// Run identifier.
        run_id: String,
        /// Display label.
        label: String,
        /// Result, truncated for display.
        result_preview: String,
    },
    /// The agent call for a run failed.
    Failed {
        /// Run identifier.
        run_id: String,
        /// Display label.
        label: String,
        /// Error description.
        error: String,
    },
    /// A run exceeded its timeout.
    TimedOut {
        /// Run identifier.
        run_id: String,
        /// Display label.
        label: String,
    },
    /// A run stopped after cancellation was requested.
    Cancelled {
        /// Run identifier.
        run_id: String,
        /// Display label.
        label: String,
    },
}

/// Depth, fan-out, and default overrides applied to every spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPolicy {
    /// Whether spawning is allowed at all.
    pub enabled: bool,
    /// Callers at this depth or deeper may not spawn.
    pub max_depth: u32,
    /// Maximum running children per parent.
    pub max_children: usize,
    /// Default run timeout when the request gives none.
    pub default_timeout: Option<Duration>,
    /// Default model when the request gives none.
    pub default_model: Option<String>,
}

impl Default for SpawnPolicy {
    fn default() -> Self {
        Self::from_config(&SubagentConfig::default())
    }
}

impl SpawnPolicy {
    /// Policy from the `[subagents]` config section.
    #[must_use]
    pub fn from_config(config: &SubagentConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_depth: config.max_depth,
            max_children: config.max_children,
            default_timeout: (config.run_timeout_seconds > 0)
                .then(|| Duration::from_secs(config.run_timeout_seconds)),
            default_model: config.model.clone(),
        }
    }
}

/// What the caller asks to spawn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Task for the sub-agent; must not be blank.
    pub task: String,
    /// Optional display label.
    pub label: Option<String>,
    /// Optional model override.
    pub model: Option<String>,
    /// Optional timeout override in seconds; 0 is treated as absent.
    pub timeout_seconds: Option<u64>,
}

impl SpawnRequest {
    /// Request with only a task.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

/// Where the spawn originates from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnContext {
    /// Workspace the new run belongs to.
    pub workspace_id: String,
    /// Run that is spawning, if the caller is itself a sub-agent.
    pub parent_run_id: Option<String>,
    /// Depth of the caller; 0 for the root agent.
    pub spawn_depth: u32,
}

impl SpawnContext {
    /// Context for a spawn issued by the root agent of `workspace_id`.
    pub fn root(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            parent_run_id: None,
            spawn_depth: 0,
        }
    }
}

enum RunOutcome {
    Completed(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Spawns and supervises sub-agent runs.
pub struct SubagentRunner {
    agent: Arc<dyn Agent>,
    registry: Arc<SubagentRegistry>,
    policy: SpawnPolicy,
    events: Option<mpsc::Sender<SubagentEvent>>,
    tracker: TaskTracker,
}

impl SubagentRunner {
    /// Create a runner; `events` receives lifecycle notifications when set.
    #[must_use]
    pub fn new(
        agent: Arc<dyn Agent>,
        registry: Arc<SubagentRegistry>,
        policy: SpawnPolicy,
        events: Option<mpsc::Sender<SubagentEvent>>,
    ) -> Self {
        Self {
            agent,
            registry,
            policy,
            events,
            tracker: TaskTracker::new(),
        }
    }

    /// Registry shared with observers.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubagentRegistry> {
        &self.registry
    }

    /// Check policy, register the run, and start it in the background.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Policy` if spawning is disabled, the task is
    /// blank, the caller is at or beyond `max_depth`, or the parent already
    /// has `max_children` running children.
    pub fn spawn(&self, request: SpawnRequest, context: &SpawnContext) -> Result<SubagentRun> {
        if !self.policy.enabled {
            return Err(AppError::Policy("sub-agents are disabled".into()));
        }
        let task = request.task.trim();
        if task.is_empty() {
            return Err(AppError::Policy("spawn requires a non-empty task".into()));
        }
        if context.spawn_depth >= self.policy.max_depth {
            return Err(AppError::Policy(format!(
                "spawn not allowed at this depth ({} >= {})",
                context.spawn_depth, self.policy.max_depth
            )));
        }
        let timeout = request
            .timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .or(self.policy.default_timeout);
        let model = request
            .model
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.policy.default_model.clone());

        let mut new_run = NewRun::new(task, context.workspace_id.clone())
            .with_depth(context.spawn_depth + 1)
            .with_label(request.label.unwrap_or_default());
        new_run.parent_run_id.clone_from(&context.parent_run_id);
        new_run.model_override = model;
        new_run.run_timeout_seconds = timeout.map(|t| t.as_secs());

        let run = self.registry.try_register(new_run, self.policy.max_children)?;
        info!(
            run_id = %run.run_id,
            workspace_id = %run.workspace_id,
            spawn_depth = run.spawn_depth,
            "sub-agent spawned"
        );
        self.emit(SubagentEvent::Started {
            run_id: run.run_id.clone(),
            label: run.label.clone(),
            task_summary: run.task_summary.clone(),
            spawn_depth: run.spawn_depth,
        });

        let cancel = self
            .registry
            .cancel_token(&run.run_id)
            .unwrap_or_default();
        let span = info_span!("subagent_run", run_id = %run.run_id);
        self.tracker.spawn(
            execute(
                Arc::clone(&self.agent),
                Arc::clone(&self.registry),
                self.events.clone(),
                run.clone(),
                timeout,
                cancel,
            )
            .instrument(span),
        );

        Ok(run)
    }

    /// Number of background runs still executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every running run and wait for all background tasks to exit.
    pub async fn shutdown(&self) {
        for run in self.registry.list_active(None) {
            self.registry.cancel(&run.run_id);
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("sub-agent runner shut down");
    }

    fn emit(&self, event: SubagentEvent) {
        emit(self.events.as_ref(), event);
    }
}

fn emit(events: Option<&mpsc::Sender<SubagentEvent>>, event: SubagentEvent) {
    if let Some(tx) = events {
        if let Err(err) = tx.try_send(event) {
            warn!(%err, "dropping sub-agent event");
        }
    }
}

async fn execute(
    agent: Arc<dyn Agent>,
    registry: Arc<SubagentRegistry>,
    events: Option<mpsc::Sender<SubagentEvent>>,
    run: SubagentRun,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    let request = AgentRequest::new(format!("subagent_{}", run.run_id), run.task.clone())
        .with_options(MessageOptions {
            subagent_run_id: Some(run.run_id.clone()),
            parent_run_id: Some(run.run_id.clone()),
            spawn_depth: run.spawn_depth,
            model_override: run.model_override.clone(),
        });

    let collect = collect_chunks(agent, &registry, request, &run.run_id, &cancel);
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, collect)
            .await
            .unwrap_or(RunOutcome::TimedOut),
        None => collect.await,
    };

    let run_id = run.run_id.as_str();
    let label = run.label.clone();
    let event = match outcome {
        RunOutcome::Completed(result) => {
            let result = result.trim();
            registry.complete(run_id, result);
            info!(run_id, "sub-agent run completed");
            SubagentEvent::Completed {
                run_id: run_id.to_owned(),
                label,
                result_preview: truncate_chars(result, RESULT_PREVIEW_CHARS),
            }
        }
        RunOutcome::Failed(error) => {
            registry.fail(run_id, &error);
            warn!(run_id, %error, "sub-agent run failed");
            SubagentEvent::Failed {
                run_id: run_id.to_owned(),
                label,
                error,
            }
        }
        RunOutcome::TimedOut => {
            registry.timeout(run_id);
            warn!(run_id, "sub-agent run timed out");
            SubagentEvent::TimedOut {
                run_id: run_id.to_owned(),
                label,
            }
        }
        RunOutcome::Cancelled => {
            registry.cancel(run_id);
            info!(run_id, "sub-agent run stopped after cancellation");
            SubagentEvent::Cancelled {
                run_id: run_id.to_owned(),
                label,
            }
        }
    };
    emit(events.as_ref(), event);
}

async fn collect_chunks(
    agent: Arc<dyn Agent>,
    registry: &SubagentRegistry,
    request: AgentRequest,
    run_id: &str,
    cancel: &CancellationToken,
) -> RunOutcome {
    let mut chunks = agent.process_message(request);
    let mut output = String::new();
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return RunOutcome::Cancelled,
            next = chunks.next() => next,
        };
        if registry.is_cancel_requested(run_id) {
            return RunOutcome::Cancelled;
        }
        match next {
            Some(Ok(chunk)) => output.push_str(&chunk),
            Some(Err(err)) => return RunOutcome::Failed(err.to_string()),
            None => return RunOutcome::Completed(output),
        }
    }
}
