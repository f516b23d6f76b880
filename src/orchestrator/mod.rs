//! Concurrency and orchestration core.
//!
//! Covers per-session request serialization, the sub-agent run registry,
//! background sub-agent execution, and idle-session housekeeping.

pub mod event_consumer;
pub mod session_queue;
pub mod session_sweeper;
pub mod subagent_registry;
pub mod subagent_runner;
