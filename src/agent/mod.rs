//! Agent collaborator abstraction.
//!
//! The [`Agent`] trait decouples the orchestration core from whatever
//! actually answers a message (an LLM round-trip with tool calls, a host
//! CLI, a test double). The core only needs a lazy, cancellable sequence
//! of text chunks per request.

pub mod cli_agent;

use std::pin::Pin;

use futures_util::Stream;

use crate::Result;

/// Lazy sequence of reply chunks produced by an [`Agent`].
///
/// An `Err` item reports an upstream failure. Dropping the stream cancels
/// the underlying work.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Per-request options forwarded to the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOptions {
    /// Set when the request executes a sub-agent run.
    pub subagent_run_id: Option<String>,
    /// Run under which further spawns from this request are parented.
    pub parent_run_id: Option<String>,
    /// Spawn depth of the caller; 0 for the root agent.
    pub spawn_depth: u32,
    /// Model to use instead of the default routing choice.
    pub model_override: Option<String>,
}

/// One message addressed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    /// Originating user (or synthetic sub-agent user).
    pub user_id: String,
    /// Message text.
    pub message: String,
    /// Request options.
    pub options: MessageOptions,
}

impl AgentRequest {
    /// Request from the root agent with default options.
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            options: MessageOptions::default(),
        }
    }

    /// Replace the request options.
    #[must_use]
    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }
}

/// Something that turns a message into a stream of reply chunks.
pub trait Agent: Send + Sync {
    /// Start processing `request` and return its reply stream.
    ///
    /// Implementations must not block; all work happens as the stream is
    /// polled.
    fn process_message(&self, request: AgentRequest) -> ChunkStream;
}
