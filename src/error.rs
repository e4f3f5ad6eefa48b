//! Error types for agentshard.

use thiserror::Error;

use crate::agent::AgentState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition for agent {agent_id}: cannot {operation} from {from}")]
    InvalidTransition {
        agent_id: String,
        operation: &'static str,
        from: AgentState,
    },

    #[error("Agent {agent_id} {hook} hook failed: {message}")]
    Hook {
        agent_id: String,
        hook: &'static str,
        message: String,
    },

    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Shard {shard_id} is at capacity ({max} agents)")]
    ShardCapacity { shard_id: String, max: usize },

    #[error("Agent not registered: {0}")]
    UnknownAgent(String),

    #[error("Rate limit exceeded for {agent_id}: {limit} messages per minute")]
    RateLimited { agent_id: String, limit: u32 },

    #[error("Message queue full for {agent_id} ({max} messages), message {message_id} failed")]
    QueueFull {
        agent_id: String,
        max: usize,
        message_id: String,
    },

    #[error("Request {message_id} timed out after {timeout_ms}ms")]
    RequestTimeout { message_id: String, timeout_ms: u64 },

    #[error("Recipient {0} is no longer registered")]
    RecipientGone(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message {0} is not a request")]
    NotARequest(String),

    #[error("Request {0} has already been answered")]
    AlreadyResponded(String),

    #[error("Protocol is shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transient errors are tied to a single send and never affect the owning component.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::UnknownAgent(_)
                | Error::RateLimited { .. }
                | Error::QueueFull { .. }
                | Error::RequestTimeout { .. }
                | Error::RecipientGone(_)
                | Error::Shutdown
        )
    }
}
