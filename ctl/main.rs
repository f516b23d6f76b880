#![forbid(unsafe_code)]

//! `agent-conductor-ctl`: local CLI companion for `agent-conductor`.
//!
//! Connects to the IPC socket and sends JSON commands to the daemon:
//! inspect and cancel sub-agent runs, spawn new ones, or push a message
//! through a session queue.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "agent-conductor-ctl",
    about = "Local CLI for agent-conductor",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, default_value = "agent-conductor")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List running sub-agents.
    Active {
        /// Only runs in this workspace.
        #[arg(long)]
        workspace: Option<String>,
    },

    /// List recently finished sub-agents, newest first.
    Recent {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only runs in this workspace.
        #[arg(long)]
        workspace: Option<String>,
    },

    /// Show one sub-agent run in full.
    Show {
        /// Run ID.
        id: String,
    },

    /// Request cancellation of a sub-agent run.
    Kill {
        /// Run ID.
        id: String,
    },

    /// Print registry and queue counters.
    Debug,

    /// Spawn a top-level sub-agent.
    Spawn {
        /// Task for the sub-agent.
        task: String,
        /// Owning workspace.
        #[arg(long)]
        workspace: Option<String>,
        /// Display label.
        #[arg(long)]
        label: Option<String>,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// Run timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send a message through a session queue and print the reply.
    Send {
        /// Session ID.
        session_id: String,
        /// Message text.
        message: String,
        /// Sender user ID.
        #[arg(long)]
        user: Option<String>,
    },
}

fn main() {
    let args = Cli::parse();

    let request_json = match &args.command {
        Command::Active { workspace } => {
            serde_json::json!({ "command": "active", "workspace": workspace })
        }
        Command::Recent { limit, workspace } => {
            serde_json::json!({ "command": "recent", "limit": limit, "workspace": workspace })
        }
        Command::Show { id } => serde_json::json!({ "command": "show", "id": id }),
        Command::Kill { id } => serde_json::json!({ "command": "kill", "id": id }),
        Command::Debug => serde_json::json!({ "command": "debug" }),
        Command::Spawn {
            task,
            workspace,
            label,
            model,
            timeout,
        } => serde_json::json!({
            "command": "spawn",
            "task": task,
            "workspace": workspace,
            "label": label,
            "model": model,
            "timeout_seconds": timeout,
        }),
        Command::Send {
            session_id,
            message,
            user,
        } => serde_json::json!({
            "command": "send",
            "session_id": session_id,
            "message": message,
            "user_id": user,
        }),
    };

    let streaming = matches!(args.command, Command::Send { .. });

    if let Err(err) = run_command(&args.ipc_name, &request_json, streaming) {
        eprintln!("Failed to talk to server: {err}");
        eprintln!("Is agent-conductor running with ipc_name '{}'?", args.ipc_name);
        std::process::exit(1);
    }
}

/// Send one command and print its response(s).
///
/// Streaming commands print each `chunk` as raw text until `done`.
fn run_command(
    ipc_name: &str,
    request: &serde_json::Value,
    streaming: bool,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    loop {
        let mut response_line = String::new();
        if reader.read_line(&mut response_line)? == 0 {
            return Ok(());
        }
        let response: serde_json::Value = serde_json::from_str(response_line.trim())?;

        let ok = response
            .get("ok")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !ok {
            let err_msg = response
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            eprintln!("Error: {err_msg}");
            std::process::exit(1);
        }

        let data = response.get("data").cloned().unwrap_or_default();
        if !streaming {
            println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default());
            return Ok(());
        }
        if let Some(chunk) = data.get("chunk").and_then(serde_json::Value::as_str) {
            print!("{chunk}");
            std::io::stdout().flush()?;
        }
        if data.get("done").and_then(serde_json::Value::as_bool) == Some(true) {
            println!();
            return Ok(());
        }
    }
}
