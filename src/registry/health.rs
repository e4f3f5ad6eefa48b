//! Registry health reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::agent::AgentState;

/// Result of one health-check pass over every registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub total: usize,
    /// Agent count per lifecycle state; every state is present.
    pub by_state: BTreeMap<AgentState, usize>,
    /// Active and responsive.
    pub healthy: usize,
    /// In `error` or unresponsive.
    pub unhealthy: usize,
    /// Ids of unresponsive agents, sorted.
    pub unresponsive: Vec<String>,
}

impl HealthReport {
    pub fn new() -> Self {
        Self {
            checked_at: Utc::now(),
            total: 0,
            by_state: AgentState::ALL.iter().map(|s| (*s, 0)).collect(),
            healthy: 0,
            unhealthy: 0,
            unresponsive: Vec::new(),
        }
    }

    pub fn record(&mut self, agent_id: &str, state: AgentState, responsive: bool) {
        self.total += 1;
        *self.by_state.entry(state).or_insert(0) += 1;

        if state == AgentState::Active && responsive {
            self.healthy += 1;
        }
        if state == AgentState::Error || !responsive {
            self.unhealthy += 1;
        }
        if !responsive {
            self.unresponsive.push(agent_id.to_string());
        }
    }

    pub fn finish(mut self) -> Self {
        self.unresponsive.sort();
        self
    }

    pub fn count(&self, state: AgentState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::new()
    }
}
