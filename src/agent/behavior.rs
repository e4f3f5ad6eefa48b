//! Pluggable lifecycle behavior for agents.

use async_trait::async_trait;

use super::Agent;
use crate::protocol::Message;

/// Hooks run after each successful lifecycle transition.
///
/// A failing lifecycle hook moves the agent to `error`. A failing `on_message`
/// is only logged.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    async fn on_spawn(&self, _agent: &Agent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_pause(&self, _agent: &Agent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_resume(&self, _agent: &Agent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_terminate(&self, _agent: &Agent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&self, _agent: &Agent, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Behavior with no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBehavior;

impl AgentBehavior for NoopBehavior {}
