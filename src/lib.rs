#![forbid(unsafe_code)]

//! Concurrency and orchestration core for a long-lived assistant daemon.
//!
//! [`orchestrator::session_queue::SessionQueue`] serializes conversational
//! turns per session under admission control and a fixed deadline, and
//! [`orchestrator::subagent_registry::SubagentRegistry`] tracks the
//! lifecycle of background sub-agent runs.

pub mod agent;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod state;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
