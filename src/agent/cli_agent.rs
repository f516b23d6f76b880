//! Host CLI agent.
//!
//! Runs the configured host CLI once per message with the message text as
//! the final argument and relays its stdout line by line. The child is
//! spawned with `kill_on_drop(true)`, so dropping the reply stream (queue
//! timeout, caller gone) terminates the process.

use std::process::Stdio;

use futures_util::{stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::{Agent, AgentRequest, ChunkStream};
use crate::config::AgentConfig;
use crate::AppError;

/// [`Agent`] backed by an external CLI process.
#[derive(Debug, Clone)]
pub struct CliAgent {
    host_cli: String,
    host_cli_args: Vec<String>,
}

enum ReadState {
    Reading {
        lines: Lines<BufReader<ChildStdout>>,
        child: Child,
    },
    Finished,
}

impl CliAgent {
    /// Build an agent from explicit program and arguments.
    pub fn new(host_cli: impl Into<String>, host_cli_args: Vec<String>) -> Self {
        Self {
            host_cli: host_cli.into(),
            host_cli_args,
        }
    }

    /// Build an agent from the `[agent]` config section.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.host_cli.clone(), config.host_cli_args.clone())
    }

    fn spawn_child(&self, request: &AgentRequest) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.host_cli);
        cmd.args(&self.host_cli_args)
            .arg(&request.message)
            .env("AGENT_CONDUCTOR_USER_ID", &request.user_id)
            .env(
                "AGENT_CONDUCTOR_SPAWN_DEPTH",
                request.options.spawn_depth.to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(ref run_id) = request.options.subagent_run_id {
            cmd.env("AGENT_CONDUCTOR_RUN_ID", run_id);
        }
        if let Some(ref model) = request.options.model_override {
            cmd.env("AGENT_CONDUCTOR_MODEL", model);
        }
        cmd.spawn()
    }
}

impl Agent for CliAgent {
    fn process_message(&self, request: AgentRequest) -> ChunkStream {
        let mut child = match self.spawn_child(&request) {
            Ok(child) => child,
            Err(err) => {
                warn!(host_cli = %self.host_cli, %err, "failed to spawn host cli");
                let failure = AppError::Agent(format!("failed to spawn host cli: {err}"));
                return stream::iter([Err(failure)]).boxed();
            }
        };
        debug!(
            pid = child.id().unwrap_or(0),
            user_id = %request.user_id,
            "host cli spawned"
        );

        let Some(stdout) = child.stdout.take() else {
            return stream::iter([Err(AppError::Agent("host cli stdout unavailable".into()))])
                .boxed();
        };
        let initial = ReadState::Reading {
            lines: BufReader::new(stdout).lines(),
            child,
        };

        stream::unfold(initial, |state| async move {
            let ReadState::Reading { mut lines, mut child } = state else {
                return None;
            };
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(format!("{line}\n")), ReadState::Reading { lines, child })),
                Ok(None) => match child.wait().await {
                    Ok(status) if status.success() => None,
                    Ok(status) => {
                        let detail = status.code().map_or_else(
                            || "terminated by signal".to_owned(),
                            |code| format!("exited with code {code}"),
                        );
                        Some((
                            Err(AppError::Agent(format!("host cli {detail}"))),
                            ReadState::Finished,
                        ))
                    }
                    Err(err) => Some((Err(AppError::Io(err.to_string())), ReadState::Finished)),
                },
                Err(err) => Some((Err(AppError::Io(err.to_string())), ReadState::Finished)),
            }
        })
        .boxed()
    }
}
