//! Global configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Host CLI used by [`CliAgent`](crate::agent::cli_agent::CliAgent) to answer messages.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Host CLI binary (e.g., `claude`).
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Arguments placed before the message text.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_cli: default_host_cli(),
            host_cli_args: Vec::new(),
        }
    }
}

fn default_host_cli() -> String {
    "claude".into()
}

/// Per-session admission, deadline, and idle eviction settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Maximum outstanding requests (waiting + processing) per session.
    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,
    /// Wall-clock bound on one processing pass.
    #[serde(default = "default_process_message_timeout")]
    pub process_message_timeout_seconds: u64,
    /// Idle time after which an unused session's lock is dropped; 0 disables eviction.
    #[serde(default = "default_idle_session_ttl")]
    pub idle_session_ttl_seconds: u64,
    /// Interval between idle-session sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_max_per_session(),
            process_message_timeout_seconds: default_process_message_timeout(),
            idle_session_ttl_seconds: default_idle_session_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl QueueConfig {
    /// Processing-pass deadline as a [`Duration`].
    #[must_use]
    pub fn process_message_timeout(&self) -> Duration {
        Duration::from_secs(self.process_message_timeout_seconds)
    }

    /// Idle eviction threshold, or `None` when eviction is disabled.
    #[must_use]
    pub fn idle_session_ttl(&self) -> Option<Duration> {
        (self.idle_session_ttl_seconds > 0)
            .then(|| Duration::from_secs(self.idle_session_ttl_seconds))
    }
}

fn default_max_per_session() -> usize {
    50
}

fn default_process_message_timeout() -> u64 {
    300
}

fn default_idle_session_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

/// Sub-agent retention and spawn policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubagentConfig {
    /// Whether agents may spawn sub-agents at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Terminal runs retained for listing before FIFO eviction.
    #[serde(default = "default_max_recent_completed")]
    pub max_recent_completed: usize,
    /// Spawning is refused once the caller's depth reaches this value.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Maximum concurrently running children per parent.
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    /// Default per-run timeout; 0 means no timeout.
    #[serde(default)]
    pub run_timeout_seconds: u64,
    /// Default model override for spawned runs.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_recent_completed: default_max_recent_completed(),
            max_depth: default_max_depth(),
            max_children: default_max_children(),
            run_timeout_seconds: 0,
            model: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_recent_completed() -> usize {
    100
}

fn default_max_depth() -> u32 {
    2
}

fn default_max_children() -> usize {
    5
}

fn default_ipc_name() -> String {
    "agent-conductor".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Named pipe / Unix socket identifier for `agent-conductor-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Host CLI agent settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Session queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Sub-agent settings.
    #[serde(default)]
    pub subagents: SubagentConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ipc_name: default_ipc_name(),
            agent: AgentConfig::default(),
            queue: QueueConfig::default(),
            subagents: SubagentConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue.max_per_session == 0 {
            return Err(AppError::Config(
                "queue.max_per_session must be greater than zero".into(),
            ));
        }
        if self.queue.process_message_timeout_seconds == 0 {
            return Err(AppError::Config(
                "queue.process_message_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.queue.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "queue.sweep_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.subagents.max_recent_completed == 0 {
            return Err(AppError::Config(
                "subagents.max_recent_completed must be greater than zero".into(),
            ));
        }
        if self.agent.host_cli.trim().is_empty() {
            return Err(AppError::Config("agent.host_cli must not be empty".into()));
        }
        Ok(())
    }
}
