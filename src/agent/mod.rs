//! Agents: identity, lifecycle state machine, heartbeat and log buffer.
//!
//! An [`Agent`] is a cheap, cloneable handle. Whoever builds it owns it; the
//! registry only keeps a [`WeakAgent`].

pub mod behavior;
mod heartbeat;
pub mod log;
pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::events::{EventChannel, Subscription};
use crate::protocol::Message;

pub use behavior::{AgentBehavior, NoopBehavior};
pub use log::{LogBuffer, LogEntry, LogLevel};
pub use state::{AgentState, Transition};

/// Notifications published on an agent's event channel.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Spawned,
    Paused,
    Resumed,
    Terminated,
    StateChanged { from: AgentState, to: AgentState },
    Heartbeat { at: DateTime<Utc> },
    Log(LogEntry),
    Message(Message),
}

/// Point-in-time view of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub shard_id: String,
    pub agent_type: String,
    pub state: AgentState,
    pub metadata: Map<String, Value>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_age_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub log_entries: usize,
}

/// Synchronous listener run on the publishing task, before subscribers see the event.
pub(crate) trait AgentObserver: Send + Sync {
    fn observe(&self, agent: &Agent, event: &AgentEvent);
}

struct AgentCore {
    state: AgentState,
    metadata: Map<String, Value>,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    terminated_at: Option<DateTime<Utc>>,
    logs: LogBuffer,
}

pub(crate) struct AgentInner {
    id: String,
    shard_id: String,
    agent_type: String,
    config: AgentConfig,
    behavior: Arc<dyn AgentBehavior>,
    core: Mutex<AgentCore>,
    events: EventChannel<AgentEvent>,
    observers: Mutex<Vec<(u64, Arc<dyn AgentObserver>)>>,
    next_observer: AtomicU64,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }
    }
}

/// Handle to one autonomous agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("shard_id", &self.inner.shard_id)
            .field("agent_type", &self.inner.agent_type)
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning reference to an agent.
#[derive(Clone, Debug)]
pub struct WeakAgent {
    inner: Weak<AgentInner>,
}

impl WeakAgent {
    pub fn upgrade(&self) -> Option<Agent> {
        self.inner.upgrade().map(|inner| Agent { inner })
    }

    /// Whether the agent has been dropped by its owner.
    pub fn is_dropped(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

/// Builder for agents.
pub struct AgentBuilder {
    id: Option<String>,
    shard_id: String,
    agent_type: String,
    config: AgentConfig,
    behavior: Arc<dyn AgentBehavior>,
    metadata: Map<String, Value>,
}

impl AgentBuilder {
    /// Use a caller-chosen id instead of a generated ULID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_log_entries(mut self, max: usize) -> Self {
        self.config.max_log_entries = max;
        self
    }

    pub fn behavior(mut self, behavior: Arc<dyn AgentBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// Add a caller metadata field.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fails with `Error::Config` if the config has a zero interval or log capacity.
    pub fn build(self) -> Result<Agent> {
        self.config.validate()?;

        let now = Utc::now();
        let mut metadata = self.metadata;
        metadata.insert("created_at".to_string(), Value::String(now.to_rfc3339()));
        metadata.insert(
            "last_state_change".to_string(),
            Value::String(now.to_rfc3339()),
        );

        let inner = AgentInner {
            id: self.id.unwrap_or_else(|| ulid::Ulid::new().to_string()),
            shard_id: self.shard_id,
            agent_type: self.agent_type,
            behavior: self.behavior,
            core: Mutex::new(AgentCore {
                state: AgentState::Initializing,
                metadata,
                last_heartbeat: Instant::now(),
                last_heartbeat_at: now,
                started_at: None,
                paused_at: None,
                terminated_at: None,
                logs: LogBuffer::new(self.config.max_log_entries),
            }),
            config: self.config,
            events: EventChannel::default(),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            heartbeat: Mutex::new(None),
        };

        let agent = Agent {
            inner: Arc::new(inner),
        };
        agent.log(LogLevel::Info, "Agent created", Value::Null);
        Ok(agent)
    }
}

impl Agent {
    /// Start building an agent in `shard_id` with the given type tag.
    pub fn builder(shard_id: impl Into<String>, agent_type: impl Into<String>) -> AgentBuilder {
        AgentBuilder {
            id: None,
            shard_id: shard_id.into(),
            agent_type: agent_type.into(),
            config: AgentConfig::default(),
            behavior: Arc::new(NoopBehavior),
            metadata: Map::new(),
        }
    }

    /// Agent with a generated id, default config and no hooks.
    pub fn new(shard_id: impl Into<String>, agent_type: impl Into<String>) -> Result<Self> {
        Self::builder(shard_id, agent_type).build()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn shard_id(&self) -> &str {
        &self.inner.shard_id
    }

    pub fn agent_type(&self) -> &str {
        &self.inner.agent_type
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn state(&self) -> AgentState {
        self.inner.core.lock().state
    }

    pub fn downgrade(&self) -> WeakAgent {
        WeakAgent {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe(&self) -> Subscription<AgentEvent> {
        self.inner.events.subscribe()
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.inner.core.lock().metadata.clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .core
            .lock()
            .metadata
            .insert(key.into(), value.into());
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.inner.core.lock().last_heartbeat_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.core.lock().started_at
    }

    pub fn paused_at(&self) -> Option<DateTime<Utc>> {
        self.inner.core.lock().paused_at
    }

    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.core.lock().terminated_at
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.inner.heartbeat.lock().is_some()
    }

    /// Activate the agent and start its heartbeat.
    pub async fn spawn(&self) -> Result<()> {
        self.transition(Transition::Spawn).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.transition(Transition::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.transition(Transition::Resume).await
    }

    /// Shut the agent down. A no-op if it is already terminating or terminated.
    pub async fn terminate(&self) -> Result<()> {
        let from = {
            let mut core = self.inner.core.lock();
            if core.state.is_terminal() {
                let state = core.state;
                drop(core);
                self.log(
                    LogLevel::Warn,
                    "Terminate requested on agent that is already shutting down",
                    serde_json::json!({ "state": state }),
                );
                return Ok(());
            }
            let from = core.state;
            Self::set_state(&mut core, AgentState::Terminating);
            from
        };

        self.stop_heartbeat();
        self.emit(AgentEvent::StateChanged {
            from,
            to: AgentState::Terminating,
        });
        self.log(LogLevel::Info, "Agent terminating", serde_json::json!({ "from": from }));

        if let Err(e) = self.inner.behavior.on_terminate(self).await {
            return Err(self.fail(Transition::Terminate.hook_name(), e));
        }

        {
            let mut core = self.inner.core.lock();
            Self::set_state(&mut core, AgentState::Terminated);
            core.terminated_at = Some(Utc::now());
        }
        self.emit(AgentEvent::StateChanged {
            from: AgentState::Terminating,
            to: AgentState::Terminated,
        });
        self.emit(AgentEvent::Terminated);
        self.log(LogLevel::Info, "Agent terminated", Value::Null);
        Ok(())
    }

    async fn transition(&self, transition: Transition) -> Result<()> {
        if transition == Transition::Terminate {
            return self.terminate().await;
        }

        let to = transition.target();
        let from = {
            let mut core = self.inner.core.lock();
            let from = core.state;
            if !transition.allows(from) {
                drop(core);
                self.log(
                    LogLevel::Warn,
                    &format!("Invalid transition: cannot {} from {}", transition.name(), from),
                    Value::Null,
                );
                return Err(Error::InvalidTransition {
                    agent_id: self.inner.id.clone(),
                    operation: transition.name(),
                    from,
                });
            }
            Self::set_state(&mut core, to);
            let now = Utc::now();
            match transition {
                Transition::Spawn => {
                    core.started_at.get_or_insert(now);
                }
                Transition::Pause => core.paused_at = Some(now),
                Transition::Resume => core.paused_at = None,
                Transition::Terminate => {}
            }
            from
        };

        match transition {
            Transition::Pause => self.stop_heartbeat(),
            _ => self.start_heartbeat(),
        }

        self.emit(AgentEvent::StateChanged { from, to });
        self.emit(match transition {
            Transition::Spawn => AgentEvent::Spawned,
            Transition::Pause => AgentEvent::Paused,
            _ => AgentEvent::Resumed,
        });
        self.log(
            LogLevel::Info,
            &format!("Agent {}", to),
            serde_json::json!({ "from": from, "operation": transition.name() }),
        );

        let hook = match transition {
            Transition::Spawn => self.inner.behavior.on_spawn(self).await,
            Transition::Pause => self.inner.behavior.on_pause(self).await,
            _ => self.inner.behavior.on_resume(self).await,
        };
        hook.map_err(|e| self.fail(transition.hook_name(), e))
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn AgentObserver>) -> u64 {
        let token = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((token, observer));
        token
    }

    pub(crate) fn remove_observer(&self, token: u64) {
        self.inner.observers.lock().retain(|(t, _)| *t != token);
    }

    /// Run observers, then publish to subscribers. No lock is held while observers run.
    fn emit(&self, event: AgentEvent) {
        let observers: Vec<Arc<dyn AgentObserver>> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer.observe(self, &event);
        }
        self.inner.events.publish(event);
    }

    fn set_state(core: &mut AgentCore, state: AgentState) {
        core.state = state;
        core.metadata.insert(
            "last_state_change".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }

    /// Force the agent into `error` after a hook failure.
    fn fail(&self, hook: &'static str, err: anyhow::Error) -> Error {
        self.stop_heartbeat();
        let from = {
            let mut core = self.inner.core.lock();
            let from = core.state;
            Self::set_state(&mut core, AgentState::Error);
            from
        };
        self.emit(AgentEvent::StateChanged {
            from,
            to: AgentState::Error,
        });

        let message = format!("{:#}", err);
        self.log(
            LogLevel::Error,
            &format!("Lifecycle hook {} failed", hook),
            serde_json::json!({ "error": message }),
        );
        Error::Hook {
            agent_id: self.inner.id.clone(),
            hook,
            message,
        }
    }

    fn start_heartbeat(&self) {
        self.beat();
        let handle = heartbeat::spawn_heartbeat(
            Arc::downgrade(&self.inner),
            self.inner.config.heartbeat_interval(),
        );
        if let Some(previous) = self.inner.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.inner.heartbeat.lock().take() {
            handle.abort();
        }
    }

    /// Stamp the heartbeat and notify observers.
    fn beat(&self) {
        let at = Utc::now();
        {
            let mut core = self.inner.core.lock();
            core.last_heartbeat = Instant::now();
            core.last_heartbeat_at = at;
        }
        tracing::trace!(agent_id = %self.inner.id, "Heartbeat");
        self.emit(AgentEvent::Heartbeat { at });
    }

    pub fn time_since_heartbeat(&self) -> Duration {
        Instant::now().saturating_duration_since(self.inner.core.lock().last_heartbeat)
    }

    /// Whether the last heartbeat is younger than `threshold`
    /// (default: twice the heartbeat interval).
    pub fn is_responsive(&self, threshold: Option<Duration>) -> bool {
        let threshold = threshold.unwrap_or_else(|| self.inner.config.heartbeat_interval() * 2);
        self.time_since_heartbeat() < threshold
    }

    /// Append a structured entry to the agent log and notify observers.
    pub fn log(&self, level: LogLevel, message: &str, extras: Value) {
        let entry = {
            let mut core = self.inner.core.lock();
            let entry = LogEntry {
                timestamp: Utc::now(),
                level,
                message: message.to_string(),
                agent_id: self.inner.id.clone(),
                shard_id: self.inner.shard_id.clone(),
                state: core.state,
                extras,
            };
            core.logs.push(entry.clone());
            entry
        };

        let agent_id = self.inner.id.as_str();
        let shard_id = self.inner.shard_id.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(agent_id, shard_id, "{}", message),
            LogLevel::Info => tracing::info!(agent_id, shard_id, "{}", message),
            LogLevel::Warn => tracing::warn!(agent_id, shard_id, "{}", message),
            LogLevel::Error => tracing::error!(agent_id, shard_id, "{}", message),
        }

        self.emit(AgentEvent::Log(entry));
    }

    /// Most recent log entries (oldest first), optionally limited to one level.
    pub fn logs(&self, limit: Option<usize>, level: Option<LogLevel>) -> Vec<LogEntry> {
        self.inner.core.lock().logs.recent(limit, level)
    }

    /// Hand a delivered message to this agent.
    pub async fn receive(&self, message: Message) -> Result<()> {
        self.log(
            LogLevel::Debug,
            "Message received",
            serde_json::json!({
                "message_id": message.id,
                "from": message.from,
                "type": message.message_type,
            }),
        );
        self.emit(AgentEvent::Message(message.clone()));

        if let Err(e) = self.inner.behavior.on_message(self, &message).await {
            let text = format!("{:#}", e);
            self.log(
                LogLevel::Warn,
                "Message handler failed",
                serde_json::json!({ "message_id": message.id, "error": text }),
            );
            return Err(Error::Hook {
                agent_id: self.inner.id.clone(),
                hook: "on_message",
                message: text,
            });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let age = self.time_since_heartbeat();
        let core = self.inner.core.lock();
        AgentSnapshot {
            id: self.inner.id.clone(),
            shard_id: self.inner.shard_id.clone(),
            agent_type: self.inner.agent_type.clone(),
            state: core.state,
            metadata: core.metadata.clone(),
            last_heartbeat: core.last_heartbeat_at,
            heartbeat_age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
            started_at: core.started_at,
            paused_at: core.paused_at,
            terminated_at: core.terminated_at,
            log_entries: core.logs.len(),
        }
    }
}
