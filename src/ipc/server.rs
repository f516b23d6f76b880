//! Local IPC server for `agent-conductor-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the session queue or the sub-agent registry.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "active", "workspace": "w1"}
//! {"command": "recent", "limit": 20}
//! {"command": "show", "id": "sub_0123456789ab"}
//! {"command": "kill", "id": "sub_0123456789ab"}
//! {"command": "debug"}
//! {"command": "spawn", "task": "summarize the inbox", "workspace": "w1"}
//! {"command": "send", "session_id": "s1", "message": "hello"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found"}
//! ```
//!
//! `send` answers with one `{"ok":true,"data":{"chunk":"..."}}` line per
//! reply chunk, then `{"ok":true,"data":{"done":true}}`.

use std::sync::Arc;

use futures_util::StreamExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::agent::AgentRequest;
use crate::models::subagent::RunSummary;
use crate::orchestrator::subagent_runner::{SpawnContext, SpawnRequest};
use crate::state::AppState;
use crate::{AppError, Result};

/// Default number of entries returned by `recent`.
const DEFAULT_RECENT_LIMIT: usize = 50;

/// User id attributed to `send` requests that do not name one.
const LOCAL_USER_ID: &str = "local";

/// Inbound IPC request from `agent-conductor-ctl`.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Run identifier (for `show`, `kill`).
    id: Option<String>,
    /// Workspace filter or spawn workspace.
    workspace: Option<String>,
    /// Maximum entries for `recent`.
    limit: Option<usize>,
    /// Task text for `spawn`.
    task: Option<String>,
    /// Label for `spawn`.
    label: Option<String>,
    /// Model override for `spawn`.
    model: Option<String>,
    /// Timeout override for `spawn`.
    timeout_seconds: Option<u64>,
    /// Target session for `send`.
    session_id: Option<String>,
    /// Sender for `send`.
    user_id: Option<String>,
    /// Message text for `send`.
    message: Option<String>,
}

/// Outbound IPC response to `agent-conductor-ctl`.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned());
        line.push('\n');
        line
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(async move {
                                    let (reader, writer) = stream.split();
                                    serve_connection(BufReader::new(reader), writer, state).await;
                                });
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Serve line-delimited JSON commands from `reader` until EOF, writing
/// responses to `writer`.
pub async fn serve_connection<R, W>(mut reader: R, mut writer: W, state: Arc<AppState>)
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let span = info_span!("ipc_conn");
    async move {
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let result = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state, &mut writer).await,
                        Err(err) => {
                            write_response(&mut writer, &IpcResponse::error(format!("invalid json: {err}")))
                                .await
                        }
                    };

                    if let Err(err) = result {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

async fn write_response<W>(writer: &mut W, response: &IpcResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.to_line().as_bytes()).await?;
    writer.flush().await
}

/// Route an IPC command to the appropriate handler.
async fn dispatch_command<W>(
    request: &IpcRequest,
    state: &Arc<AppState>,
    writer: &mut W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let span = info_span!("ipc_command", command = %request.command);

    if request.command == "send" {
        return handle_send(request, state, writer).instrument(span).await;
    }

    let response = span.in_scope(|| match request.command.as_str() {
        "active" => handle_active(request, state),
        "recent" => handle_recent(request, state),
        "show" => handle_show(request, state),
        "kill" => handle_kill(request, state),
        "debug" => handle_debug(state),
        "spawn" => handle_spawn(request, state),
        other => IpcResponse::error(format!("unknown command: {other}")),
    });
    write_response(writer, &response).await
}

fn summaries(runs: &[crate::models::subagent::SubagentRun]) -> Vec<RunSummary> {
    runs.iter().map(crate::models::subagent::SubagentRun::summary).collect()
}

/// List running sub-agents.
fn handle_active(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let runs = state.registry().list_active(request.workspace.as_deref());
    IpcResponse::success(serde_json::json!({ "runs": summaries(&runs) }))
}

/// List recently finished sub-agents.
fn handle_recent(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let limit = request.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    let runs = state
        .registry()
        .list_recent_completed(limit, request.workspace.as_deref());
    IpcResponse::success(serde_json::json!({ "runs": summaries(&runs) }))
}

/// Show one run in full.
fn handle_show(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let Some(ref id) = request.id else {
        return IpcResponse::error("missing required 'id' field");
    };
    match state.registry().get(id) {
        Some(run) => match serde_json::to_value(&run) {
            Ok(value) => IpcResponse::success(value),
            Err(err) => IpcResponse::error(format!("failed to encode run: {err}")),
        },
        None => IpcResponse::error(AppError::NotFound(format!("run {id}")).to_string()),
    }
}

/// Request cancellation of a run.
fn handle_kill(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let Some(ref id) = request.id else {
        return IpcResponse::error("missing required 'id' field");
    };
    let registry = state.registry();
    registry.cancel(id);
    let status = registry.get(id).map(|run| run.status.to_string());
    info!(run_id = %id, "cancellation requested via IPC");
    IpcResponse::success(serde_json::json!({
        "run_id": id,
        "cancel_requested": registry.is_cancel_requested(id),
        "status": status,
    }))
}

/// Registry and queue counters.
fn handle_debug(state: &AppState) -> IpcResponse {
    let registry = state.registry().get_debug_info();
    IpcResponse::success(serde_json::json!({
        "registry": registry,
        "sessions": state.queue.session_count(),
        "subagents_in_flight": state.runner.in_flight(),
    }))
}

/// Spawn a top-level sub-agent on behalf of the local operator.
fn handle_spawn(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let Some(ref task) = request.task else {
        return IpcResponse::error("missing required 'task' field");
    };
    let spawn = SpawnRequest {
        task: task.clone(),
        label: request.label.clone(),
        model: request.model.clone(),
        timeout_seconds: request.timeout_seconds,
    };
    let context = SpawnContext::root(request.workspace.clone().unwrap_or_default());
    match state.runner.spawn(spawn, &context) {
        Ok(run) => IpcResponse::success(serde_json::json!({
            "run_id": run.run_id,
            "label": run.label,
            "spawn_depth": run.spawn_depth,
        })),
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

/// Relay a message through the session queue, one line per chunk.
async fn handle_send<W>(
    request: &IpcRequest,
    state: &Arc<AppState>,
    writer: &mut W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (Some(session_id), Some(message)) = (&request.session_id, &request.message) else {
        return write_response(
            writer,
            &IpcResponse::error("missing required 'session_id' or 'message' field"),
        )
        .await;
    };
    let user_id = request.user_id.as_deref().unwrap_or(LOCAL_USER_ID);

    let mut replies = state
        .queue
        .process_message(session_id, AgentRequest::new(user_id, message.clone()));
    while let Some(chunk) = replies.next().await {
        write_response(writer, &IpcResponse::success(serde_json::json!({ "chunk": chunk }))).await?;
    }
    write_response(writer, &IpcResponse::success(serde_json::json!({ "done": true }))).await
}
