#![forbid(unsafe_code)]

//! `agent-conductor`: assistant orchestration daemon.
//!
//! Bootstraps configuration, builds the session queue and sub-agent
//! runner around the host CLI agent, and serves `agent-conductor-ctl`
//! over local IPC until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conductor::agent::cli_agent::CliAgent;
use agent_conductor::agent::Agent;
use agent_conductor::config::GlobalConfig;
use agent_conductor::ipc::server::spawn_ipc_server;
use agent_conductor::orchestrator::event_consumer::spawn_subagent_event_logger;
use agent_conductor::orchestrator::session_queue::SessionQueue;
use agent_conductor::orchestrator::session_sweeper::spawn_session_sweeper;
use agent_conductor::orchestrator::subagent_registry::SubagentRegistry;
use agent_conductor::orchestrator::subagent_runner::{SpawnPolicy, SubagentRunner};
use agent_conductor::state::AppState;
use agent_conductor::{AppError, Result};

/// Capacity of the sub-agent lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conductor", about = "Assistant orchestration daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the IPC socket name from the configuration.
    #[arg(long)]
    ipc_name: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-conductor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(name) = args.ipc_name {
        config.ipc_name = name;
    }
    let config = Arc::new(config);
    info!(
        host_cli = %config.agent.host_cli,
        max_per_session = config.queue.max_per_session,
        timeout_secs = config.queue.process_message_timeout_seconds,
        "configuration loaded"
    );

    // ── Build orchestration core ────────────────────────
    let agent: Arc<dyn Agent> = Arc::new(CliAgent::from_config(&config.agent));
    let queue = Arc::new(SessionQueue::from_config(Arc::clone(&agent), &config.queue));
    let registry = Arc::new(SubagentRegistry::new(config.subagents.max_recent_completed));
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let runner = Arc::new(SubagentRunner::new(
        agent,
        registry,
        SpawnPolicy::from_config(&config.subagents),
        Some(event_tx),
    ));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        queue: Arc::clone(&queue),
        runner: Arc::clone(&runner),
    });

    // ── Start background services ───────────────────────
    let ct = CancellationToken::new();
    let logger_ct = CancellationToken::new();
    let logger_handle = spawn_subagent_event_logger(event_rx, logger_ct.clone());

    let sweeper_handle = config.queue.idle_session_ttl().map(|ttl| {
        spawn_session_sweeper(
            Arc::clone(&queue),
            ttl,
            Duration::from_secs(config.queue.sweep_interval_seconds),
            ct.clone(),
        )
    });
    if sweeper_handle.is_none() {
        info!("idle session eviction disabled");
    }

    let ipc_handle = spawn_ipc_server(Arc::clone(&state), ct.clone())?;
    info!("agent-conductor ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Err(err) = ipc_handle.await {
        error!(%err, "ipc server task failed");
    }
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }

    // The event logger must outlive the runner.
    runner.shutdown().await;
    logger_ct.cancel();
    let _ = logger_handle.await;
    info!("agent-conductor shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
