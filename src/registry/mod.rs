//! Agent registry: discovery indexes and periodic health checks.
//!
//! The registry indexes agents by id, shard and type. It never owns agents; it
//! keeps weak references, skips any agent that has gone away and prunes such
//! entries on the next registration or health check.

pub mod health;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentEvent, AgentObserver, AgentState, WeakAgent};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::events::{EventChannel, Subscription};

pub use health::HealthReport;

/// Notifications published by a registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        agent_id: String,
        shard_id: String,
        agent_type: String,
    },
    Deregistered {
        agent_id: String,
        shard_id: String,
        agent_type: String,
    },
    AgentStateChanged {
        agent_id: String,
        from: AgentState,
        to: AgentState,
    },
    HealthCheck(HealthReport),
    /// Agents that became unresponsive since the previous check.
    UnresponsiveAgents(Vec<String>),
    Shutdown,
}

struct Entry {
    agent: WeakAgent,
    shard_id: String,
    agent_type: String,
    /// Token of the observer installed on the agent.
    observer: u64,
}

#[derive(Default)]
struct Index {
    agents: HashMap<String, Entry>,
    by_shard: HashMap<String, HashSet<String>>,
    by_type: HashMap<String, HashSet<String>>,
}

impl Index {
    fn live(&self, agent_id: &str) -> Option<Agent> {
        self.agents.get(agent_id).and_then(|e| e.agent.upgrade())
    }

    fn remove(&mut self, agent_id: &str) -> Option<Entry> {
        let entry = self.agents.remove(agent_id)?;
        unindex(&mut self.by_shard, &entry.shard_id, agent_id);
        unindex(&mut self.by_type, &entry.agent_type, agent_id);
        Some(entry)
    }

    /// Drop entries whose agent no longer exists.
    fn prune(&mut self) -> Vec<(String, Entry)> {
        let dead: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, e)| e.agent.is_dropped())
            .map(|(id, _)| id.clone())
            .collect();
        dead.into_iter()
            .filter_map(|id| self.remove(&id).map(|e| (id, e)))
            .collect()
    }

    fn live_in(&self, ids: Option<&HashSet<String>>) -> Vec<Agent> {
        let mut agents: Vec<Agent> = ids
            .into_iter()
            .flatten()
            .filter_map(|id| self.live(id))
            .collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }
}

fn unindex(map: &mut HashMap<String, HashSet<String>>, key: &str, agent_id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(agent_id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

struct RegistryInner {
    config: RegistryConfig,
    index: RwLock<Index>,
    events: EventChannel<RegistryEvent>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    unresponsive: Mutex<HashSet<String>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
        for entry in self.index.get_mut().agents.values() {
            if let Some(agent) = entry.agent.upgrade() {
                agent.remove_observer(entry.observer);
            }
        }
    }
}

/// Installed on every registered agent. Runs on the agent's own transition, so
/// a terminated agent is already deregistered when `terminate` returns.
struct RegistryObserver {
    registry: Weak<RegistryInner>,
}

impl AgentObserver for RegistryObserver {
    fn observe(&self, agent: &Agent, event: &AgentEvent) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let registry = AgentRegistry { inner };
        match event {
            AgentEvent::StateChanged { from, to } => {
                registry
                    .inner
                    .events
                    .publish(RegistryEvent::AgentStateChanged {
                        agent_id: agent.id().to_string(),
                        from: *from,
                        to: *to,
                    });
            }
            AgentEvent::Terminated => {
                registry.deregister(agent.id());
            }
            _ => {}
        }
    }
}

/// Cloneable handle to a registry.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RegistryInner>,
}

impl AgentRegistry {
    /// Create a registry and start its health-check timer.
    ///
    /// Fails with `Error::Config` on a zero interval or capacity. Must be called
    /// from within a Tokio runtime.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                index: RwLock::new(Index::default()),
                events: EventChannel::default(),
                health_task: Mutex::new(None),
                unresponsive: Mutex::new(HashSet::new()),
            }),
        };
        registry.start_health_monitor();
        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> Subscription<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Index an agent and start following its state changes.
    pub fn register(&self, agent: &Agent) -> Result<()> {
        let agent_id = agent.id().to_string();
        let shard_id = agent.shard_id().to_string();
        let agent_type = agent.agent_type().to_string();

        if agent_id.trim().is_empty() {
            return Err(Error::Validation("agent id is required".to_string()));
        }
        if shard_id.trim().is_empty() {
            return Err(Error::Validation(format!(
                "agent {} has no shard id",
                agent_id
            )));
        }

        let pruned = {
            let mut index = self.inner.index.write();
            let pruned = index.prune();
            if index.agents.contains_key(&agent_id) {
                drop(index);
                self.announce_pruned(pruned);
                return Err(Error::DuplicateAgent(agent_id));
            }
            let max = self.inner.config.max_agents_per_shard;
            let shard_size = index.by_shard.get(&shard_id).map_or(0, HashSet::len);
            if shard_size >= max {
                drop(index);
                self.announce_pruned(pruned);
                return Err(Error::ShardCapacity { shard_id, max });
            }

            let observer = agent.add_observer(Arc::new(RegistryObserver {
                registry: Arc::downgrade(&self.inner),
            }));
            index.agents.insert(
                agent_id.clone(),
                Entry {
                    agent: agent.downgrade(),
                    shard_id: shard_id.clone(),
                    agent_type: agent_type.clone(),
                    observer,
                },
            );
            index
                .by_shard
                .entry(shard_id.clone())
                .or_default()
                .insert(agent_id.clone());
            index
                .by_type
                .entry(agent_type.clone())
                .or_default()
                .insert(agent_id.clone());
            pruned
        };

        self.announce_pruned(pruned);
        info!(agent_id = %agent_id, shard_id = %shard_id, agent_type = %agent_type, "Agent registered");
        self.inner.events.publish(RegistryEvent::Registered {
            agent_id,
            shard_id,
            agent_type,
        });
        Ok(())
    }

    /// Remove an agent from every index. Returns `false` if it was not registered.
    pub fn deregister(&self, agent_id: &str) -> bool {
        let Some(entry) = self.inner.index.write().remove(agent_id) else {
            return false;
        };

        if let Some(agent) = entry.agent.upgrade() {
            agent.remove_observer(entry.observer);
        }
        self.inner.unresponsive.lock().remove(agent_id);

        info!(agent_id = %agent_id, shard_id = %entry.shard_id, "Agent deregistered");
        self.inner.events.publish(RegistryEvent::Deregistered {
            agent_id: agent_id.to_string(),
            shard_id: entry.shard_id,
            agent_type: entry.agent_type,
        });
        true
    }

    /// Publish `Deregistered` for entries whose agent was dropped.
    fn announce_pruned(&self, pruned: Vec<(String, Entry)>) {
        if pruned.is_empty() {
            return;
        }
        let mut unresponsive = self.inner.unresponsive.lock();
        for (agent_id, _) in &pruned {
            unresponsive.remove(agent_id);
        }
        drop(unresponsive);

        for (agent_id, entry) in pruned {
            info!(agent_id = %agent_id, shard_id = %entry.shard_id, "Dropped agent pruned");
            self.inner.events.publish(RegistryEvent::Deregistered {
                agent_id,
                shard_id: entry.shard_id,
                agent_type: entry.agent_type,
            });
        }
    }

    /// Remove every entry whose agent has been dropped. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let pruned = self.inner.index.write().prune();
        let count = pruned.len();
        self.announce_pruned(pruned);
        count
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.inner.index.read().live(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.get_agent(agent_id).is_some()
    }

    /// Live agents in a shard, sorted by id.
    pub fn agents_by_shard(&self, shard_id: &str) -> Vec<Agent> {
        let index = self.inner.index.read();
        index.live_in(index.by_shard.get(shard_id))
    }

    /// Live agents of a type, sorted by id.
    pub fn agents_by_type(&self, agent_type: &str) -> Vec<Agent> {
        let index = self.inner.index.read();
        index.live_in(index.by_type.get(agent_type))
    }

    pub fn all_agents(&self) -> Vec<Agent> {
        let index = self.inner.index.read();
        let mut agents: Vec<Agent> = index
            .agents
            .values()
            .filter_map(|e| e.agent.upgrade())
            .collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    /// Shard ids with at least one registered agent, sorted.
    pub fn shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.inner.index.read().by_shard.keys().cloned().collect();
        shards.sort();
        shards
    }

    /// Agent types with at least one registered agent, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.index.read().by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// Live agents in a shard.
    pub fn shard_size(&self, shard_id: &str) -> usize {
        let index = self.inner.index.read();
        index.by_shard.get(shard_id).map_or(0, |ids| {
            ids.iter()
                .filter(|id| index.agents.get(*id).is_some_and(|e| !e.agent.is_dropped()))
                .count()
        })
    }

    /// Live registered agents.
    pub fn agent_count(&self) -> usize {
        self.inner
            .index
            .read()
            .agents
            .values()
            .filter(|e| !e.agent.is_dropped())
            .count()
    }

    /// One pass over every live agent.
    pub fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::new();
        for agent in self.all_agents() {
            report.record(agent.id(), agent.state(), agent.is_responsive(None));
        }
        report.finish()
    }

    /// Run a health check and publish its results.
    pub fn run_health_check(&self) -> HealthReport {
        self.prune();
        let report = self.health_check();

        let newly_unresponsive: Vec<String> = {
            let mut known = self.inner.unresponsive.lock();
            let current: HashSet<String> = report.unresponsive.iter().cloned().collect();
            let mut fresh: Vec<String> = current.difference(&known).cloned().collect();
            fresh.sort();
            *known = current;
            fresh
        };

        debug!(
            total = report.total,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            "Health check completed"
        );
        self.inner
            .events
            .publish(RegistryEvent::HealthCheck(report.clone()));

        if !newly_unresponsive.is_empty() {
            warn!(agents = ?newly_unresponsive, "Agents became unresponsive");
            self.inner
                .events
                .publish(RegistryEvent::UnresponsiveAgents(newly_unresponsive));
        }
        report
    }

    pub fn is_health_monitor_running(&self) -> bool {
        self.inner.health_task.lock().is_some()
    }

    fn start_health_monitor(&self) {
        let period = self.inner.config.health_check_interval();
        let registry = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                AgentRegistry { inner }.run_health_check();
            }
        });
        if let Some(previous) = self.inner.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the health timer and deregister every agent. Agents keep running.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.health_task.lock().take() {
            handle.abort();
        }

        let ids: Vec<String> = self.inner.index.read().agents.keys().cloned().collect();
        let count = ids.len();
        for id in ids {
            self.deregister(&id);
        }

        info!(deregistered = count, "Registry shut down");
        self.inner.events.publish(RegistryEvent::Shutdown);
    }
}
