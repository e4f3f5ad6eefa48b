//! agentshard library root.
//!
//! A sharded agent runtime: agents with a supervised lifecycle, a registry that
//! indexes them by shard and type, and a protocol that routes prioritised
//! messages between them.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod protocol;
pub mod registry;

pub use agent::{Agent, AgentBehavior, AgentEvent, AgentState, LogLevel};
pub use cli::Commands;
pub use config::{load_settings, load_settings_or_default, Settings};
pub use error::{Error, Result};
pub use protocol::{CommunicationProtocol, Message, MessageType, Priority, ProtocolEvent, SendOptions, SendOutcome};
pub use registry::{AgentRegistry, HealthReport, RegistryEvent};
