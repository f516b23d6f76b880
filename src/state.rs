//! Shared application state handed to transports.

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::orchestrator::session_queue::SessionQueue;
use crate::orchestrator::subagent_registry::SubagentRegistry;
use crate::orchestrator::subagent_runner::SubagentRunner;

/// Everything a transport needs to serve requests.
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GlobalConfig>,
    /// Per-session message queue.
    pub queue: Arc<SessionQueue>,
    /// Sub-agent runner; owns the shared registry.
    pub runner: Arc<SubagentRunner>,
}

impl AppState {
    /// Registry shared by the runner and observers.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubagentRegistry> {
        self.runner.registry()
    }
}
