//! Agent lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Active,
    Paused,
    Terminating,
    Terminated,
    /// Entered when a lifecycle hook fails.
    Error,
}

impl AgentState {
    pub const ALL: [AgentState; 6] = [
        AgentState::Initializing,
        AgentState::Active,
        AgentState::Paused,
        AgentState::Terminating,
        AgentState::Terminated,
        AgentState::Error,
    ];

    /// Terminating and terminated agents accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Terminating | AgentState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Initializing => "initializing",
            AgentState::Active => "active",
            AgentState::Paused => "paused",
            AgentState::Terminating => "terminating",
            AgentState::Terminated => "terminated",
            AgentState::Error => "error",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Spawn,
    Pause,
    Resume,
    Terminate,
}

impl Transition {
    pub const ALL: [Transition; 4] = [
        Transition::Spawn,
        Transition::Pause,
        Transition::Resume,
        Transition::Terminate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Transition::Spawn => "spawn",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Terminate => "terminate",
        }
    }

    pub fn hook_name(self) -> &'static str {
        match self {
            Transition::Spawn => "on_spawn",
            Transition::Pause => "on_pause",
            Transition::Resume => "on_resume",
            Transition::Terminate => "on_terminate",
        }
    }

    /// Whether `from` is a legal source state.
    ///
    /// `error` is absorbing for everything except terminate.
    pub fn allows(self, from: AgentState) -> bool {
        match self {
            Transition::Spawn => matches!(from, AgentState::Initializing | AgentState::Paused),
            Transition::Pause => from == AgentState::Active,
            Transition::Resume => from == AgentState::Paused,
            Transition::Terminate => !from.is_terminal(),
        }
    }

    /// State reached once the transition (and its hook) completes.
    pub fn target(self) -> AgentState {
        match self {
            Transition::Spawn | Transition::Resume => AgentState::Active,
            Transition::Pause => AgentState::Paused,
            Transition::Terminate => AgentState::Terminated,
        }
    }
}
