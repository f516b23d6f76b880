//! Integration tests for the IPC command protocol.
//!
//! Drives [`serve_connection`] over an in-memory duplex pipe, so no named
//! socket is created.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

use agent_conductor::agent::Agent;
use agent_conductor::config::GlobalConfig;
use agent_conductor::ipc::server::serve_connection;
use agent_conductor::orchestrator::session_queue::SessionQueue;
use agent_conductor::orchestrator::subagent_registry::SubagentRegistry;
use agent_conductor::orchestrator::subagent_runner::{SpawnPolicy, SubagentRunner};
use agent_conductor::state::AppState;

use super::test_helpers::{wait_until, FakeAgent};

struct Client {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(3), self.lines.next_line())
            .await
            .expect("response in time")
            .unwrap()
            .expect("connection open");
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, line: &str) -> Value {
        self.send(line).await;
        self.recv().await
    }
}

fn state() -> Arc<AppState> {
    let agent: Arc<dyn Agent> = FakeAgent::new();
    let config = Arc::new(GlobalConfig::default());
    let queue = Arc::new(SessionQueue::from_config(Arc::clone(&agent), &config.queue));
    let runner = Arc::new(SubagentRunner::new(
        agent,
        Arc::new(SubagentRegistry::default()),
        SpawnPolicy::default(),
        None,
    ));
    Arc::new(AppState {
        config,
        queue,
        runner,
    })
}

fn connect(state: &Arc<AppState>) -> Client {
    let (client, server) = tokio::io::duplex(16 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    tokio::spawn(serve_connection(
        BufReader::new(server_read),
        server_write,
        Arc::clone(state),
    ));
    let (client_read, writer) = tokio::io::split(client);
    Client {
        lines: BufReader::new(client_read).lines(),
        writer,
    }
}

#[tokio::test]
async fn debug_reports_counters() {
    let state = state();
    let mut client = connect(&state);

    let response = client.call(r#"{"command":"debug"}"#).await;

    assert_eq!(response["ok"], true);
    assert_eq!(response["data"]["registry"]["total_runs"], 0);
    assert_eq!(response["data"]["sessions"], 0);
    assert_eq!(response["data"]["subagents_in_flight"], 0);
}

#[tokio::test]
async fn spawn_show_active_and_kill() {
    let state = state();
    let mut client = connect(&state);

    let spawned = client
        .call(r#"{"command":"spawn","task":"hang","workspace":"w1","label":"Waiter"}"#)
        .await;
    assert_eq!(spawned["ok"], true);
    assert_eq!(spawned["data"]["label"], "Waiter");
    assert_eq!(spawned["data"]["spawn_depth"], 1);
    let run_id = spawned["data"]["run_id"].as_str().unwrap().to_owned();
    assert!(run_id.starts_with("sub_"));

    let active = client.call(r#"{"command":"active","workspace":"w1"}"#).await;
    let runs = active["data"]["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["run_id"], run_id.as_str());
    assert_eq!(runs[0]["status"], "running");

    let other = client.call(r#"{"command":"active","workspace":"w2"}"#).await;
    assert!(other["data"]["runs"].as_array().unwrap().is_empty());

    let shown = client
        .call(&format!(r#"{{"command":"show","id":"{run_id}"}}"#))
        .await;
    assert_eq!(shown["data"]["task"], "hang");
    assert_eq!(shown["data"]["workspace_id"], "w1");

    let killed = client
        .call(&format!(r#"{{"command":"kill","id":"{run_id}"}}"#))
        .await;
    assert_eq!(killed["ok"], true);
    assert_eq!(killed["data"]["cancel_requested"], true);
    assert_eq!(killed["data"]["status"], "cancelled");

    let recent = client.call(r#"{"command":"recent","limit":5}"#).await;
    let runs = recent["data"]["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["status"], "cancelled");

    let runner = Arc::clone(&state.runner);
    assert!(wait_until(Duration::from_secs(2), || runner.in_flight() == 0).await);
}

#[tokio::test]
async fn kill_unknown_id_still_records_request() {
    let state = state();
    let mut client = connect(&state);

    let killed = client.call(r#"{"command":"kill","id":"sub_missing"}"#).await;

    assert_eq!(killed["ok"], true);
    assert_eq!(killed["data"]["cancel_requested"], true);
    assert!(killed["data"]["status"].is_null());
    assert!(state.registry().is_cancel_requested("sub_missing"));
}

#[tokio::test]
async fn send_streams_chunks_then_done() {
    let state = state();
    let mut client = connect(&state);

    client
        .send(r#"{"command":"send","session_id":"s1","message":"chunks:one,two"}"#)
        .await;

    assert_eq!(client.recv().await["data"]["chunk"], "one");
    assert_eq!(client.recv().await["data"]["chunk"], "two");
    assert_eq!(client.recv().await["data"]["done"], true);
    assert_eq!(state.queue.session_count(), 1);
}

#[tokio::test]
async fn malformed_requests_get_errors_and_connection_survives() {
    let state = state();
    let mut client = connect(&state);

    let invalid = client.call("not json").await;
    assert_eq!(invalid["ok"], false);
    assert!(invalid["error"].as_str().unwrap().starts_with("invalid json"));

    let unknown = client.call(r#"{"command":"explode"}"#).await;
    assert_eq!(unknown["error"], "unknown command: explode");

    let missing = client.call(r#"{"command":"show"}"#).await;
    assert_eq!(missing["error"], "missing required 'id' field");

    let not_found = client.call(r#"{"command":"show","id":"sub_nope"}"#).await;
    assert_eq!(not_found["error"], "not found: run sub_nope");

    let no_session = client.call(r#"{"command":"send","message":"hi"}"#).await;
    assert_eq!(no_session["ok"], false);

    let blank = client.call(r#"{"command":"spawn","task":"  "}"#).await;
    assert_eq!(blank["ok"], false);
    assert!(blank["error"].as_str().unwrap().starts_with("policy:"));

    let still_alive = client.call(r#"{"command":"debug"}"#).await;
    assert_eq!(still_alive["ok"], true);
}
