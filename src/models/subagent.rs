//! Sub-agent run model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::truncate_chars;

/// Longest task summary kept for display.
pub const SUMMARY_MAX_CHARS: usize = 80;

/// Label used when neither an explicit label nor a task summary exists.
pub const FALLBACK_LABEL: &str = "Sub-agent";

/// Lifecycle status for a sub-agent run.
///
/// `Running` is the only non-terminal state; every other state is
/// reached directly from `Running` and never left.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    /// Run is executing.
    Running,
    /// Run finished and produced a result.
    Completed,
    /// Run raised an error.
    Failed,
    /// Run exceeded its timeout.
    TimedOut,
    /// Run was cancelled while still running.
    Cancelled,
}

impl SubagentStatus {
    /// Whether the status can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Stable lowercase name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one spawned background run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubagentRun {
    /// Process-unique identifier (`sub_` + 12 hex chars).
    pub run_id: String,
    /// Full task description handed to the sub-agent.
    pub task: String,
    /// Display label.
    pub label: String,
    /// First line of the task, truncated for display.
    pub task_summary: String,
    /// Current lifecycle status.
    pub status: SubagentStatus,
    /// Owning workspace, used to scope listings.
    pub workspace_id: String,
    /// Run that spawned this one; `None` for top-level spawns.
    pub parent_run_id: Option<String>,
    /// Generation count from the root agent (root children = 1).
    pub spawn_depth: u32,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Set exactly once, on the transition out of `Running`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result text for completed runs.
    pub result: String,
    /// Error text for failed or timed-out runs.
    pub error: String,
    /// Model override used for this run.
    pub model_override: Option<String>,
    /// Per-run timeout override.
    pub run_timeout_seconds: Option<u64>,
}

impl SubagentRun {
    /// Whether the run is still executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == SubagentStatus::Running
    }

    /// Serializable listing view with long text fields truncated.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            task: truncate_chars(&self.task, 200),
            task_summary: self.task_summary.clone(),
            label: self.label.clone(),
            status: self.status,
            workspace_id: self.workspace_id.clone(),
            parent_run_id: self.parent_run_id.clone(),
            spawn_depth: self.spawn_depth,
            created_at: self.created_at,
            completed_at: self.completed_at,
            result: truncate_chars(&self.result, 2000),
            error: self.error.clone(),
            model_override: self.model_override.clone(),
            run_timeout_seconds: self.run_timeout_seconds,
        }
    }
}

/// Listing view of a [`SubagentRun`] for monitoring surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: String,
    /// Task, truncated to 200 characters.
    pub task: String,
    /// First line of the task.
    pub task_summary: String,
    /// Display label.
    pub label: String,
    /// Lifecycle status.
    pub status: SubagentStatus,
    /// Owning workspace.
    pub workspace_id: String,
    /// Parent run, if any.
    pub parent_run_id: Option<String>,
    /// Spawn depth.
    pub spawn_depth: u32,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Terminal transition timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result, truncated to 2000 characters.
    pub result: String,
    /// Error text.
    pub error: String,
    /// Model override.
    pub model_override: Option<String>,
    /// Timeout override.
    pub run_timeout_seconds: Option<u64>,
}

/// Parameters for registering a new run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    /// Task description.
    pub task: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Parent run, if spawned by another sub-agent.
    pub parent_run_id: Option<String>,
    /// Spawn depth (defaults to 1).
    pub spawn_depth: u32,
    /// Explicit label; empty means derive from the task.
    pub label: String,
    /// Model override.
    pub model_override: Option<String>,
    /// Timeout override.
    pub run_timeout_seconds: Option<u64>,
}

impl NewRun {
    /// Top-level run at depth 1 with no overrides.
    pub fn new(task: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            workspace_id: workspace_id.into(),
            parent_run_id: None,
            spawn_depth: 1,
            label: String::new(),
            model_override: None,
            run_timeout_seconds: None,
        }
    }

    /// Set the parent run.
    #[must_use]
    pub fn with_parent(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    /// Set the spawn depth.
    #[must_use]
    pub fn with_depth(mut self, spawn_depth: u32) -> Self {
        self.spawn_depth = spawn_depth;
        self
    }

    /// Set an explicit label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the model override.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    /// Set the per-run timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.run_timeout_seconds = Some(seconds);
        self
    }

    /// Build the `Running` snapshot for a freshly generated `run_id`.
    #[must_use]
    pub fn into_run(self, run_id: String) -> SubagentRun {
        let task_summary = summarize_task(&self.task);
        let label = [self.label.trim(), task_summary.as_str()]
            .into_iter()
            .find(|candidate| !candidate.is_empty())
            .unwrap_or(FALLBACK_LABEL)
            .to_owned();

        SubagentRun {
            run_id,
            task: self.task,
            label,
            task_summary,
            status: SubagentStatus::Running,
            workspace_id: self.workspace_id,
            parent_run_id: self.parent_run_id,
            spawn_depth: self.spawn_depth,
            created_at: Utc::now(),
            completed_at: None,
            result: String::new(),
            error: String::new(),
            model_override: self.model_override,
            run_timeout_seconds: self.run_timeout_seconds,
        }
    }
}

/// First line of the trimmed task, cut to [`SUMMARY_MAX_CHARS`] with `…`.
#[must_use]
pub fn summarize_task(task: &str) -> String {
    let first_line = task.trim().lines().next().unwrap_or_default();
    truncate_chars(first_line, SUMMARY_MAX_CHARS)
}
