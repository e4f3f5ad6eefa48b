//! Periodic heartbeat task for an active agent.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{Agent, AgentInner};

/// Spawn the heartbeat loop. The first beat fires one `period` from now.
///
/// The task only holds a weak reference and exits once the agent is dropped.
pub(super) fn spawn_heartbeat(agent: Weak<AgentInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = agent.upgrade() else {
                break;
            };
            Agent { inner }.beat();
        }
    })
}
