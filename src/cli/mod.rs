//! CLI commands for agentshard using clap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use crate::agent::{Agent, AgentBehavior, AgentSnapshot};
use crate::config::{load_settings, load_settings_or_default, Settings};
use crate::protocol::{
    BroadcastReport, CommunicationProtocol, Message, MessageType, Priority, ProtocolStats,
    SendOptions,
};
use crate::registry::{AgentRegistry, HealthReport};

/// agentshard - sharded agent runtime.
#[derive(Parser)]
#[command(name = "agentshard")]
#[command(version)]
#[command(about = "Sharded agent runtime: lifecycle, discovery and messaging", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Spawn a demo population, exchange messages and print a summary
    Demo {
        /// Number of shards
        #[arg(long, default_value_t = 2)]
        shards: usize,

        /// Agents spawned in each shard
        #[arg(long, default_value_t = 3)]
        agents_per_shard: usize,

        /// Settings file (defaults to ~/.agentshard/settings.json)
        #[arg(long, env = "AGENTSHARD_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Spawn a demo population and print one health report
    Health {
        #[arg(long, env = "AGENTSHARD_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print the effective settings
    Config {
        #[arg(long, env = "AGENTSHARD_CONFIG")]
        config: Option<PathBuf>,
    },
}

impl Commands {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Demo {
                shards,
                agents_per_shard,
                config,
            } => cmd_demo(*shards, *agents_per_shard, config.as_deref()).await,
            Command::Health { config } => cmd_health(config.as_deref()).await,
            Command::Config { config } => cmd_config(config.as_deref()),
        }
    }
}

/// An explicit path must load cleanly; otherwise fall back to defaults.
fn resolve_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => load_settings(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(load_settings_or_default(None)),
    }
}

/// Answers every request with an echo of its payload.
struct EchoBehavior {
    protocol: CommunicationProtocol,
}

#[async_trait]
impl AgentBehavior for EchoBehavior {
    async fn on_message(&self, agent: &Agent, message: &Message) -> Result<()> {
        if message.message_type == MessageType::Request {
            self.protocol
                .respond(&message.id, json!({ "echo": message.payload, "by": agent.id() }))
                .await?;
        }
        Ok(())
    }
}

/// A registry, a protocol and the agents they serve.
struct Population {
    registry: AgentRegistry,
    protocol: CommunicationProtocol,
    agents: Vec<Agent>,
}

impl Population {
    async fn spawn(settings: &Settings, shards: usize, agents_per_shard: usize) -> Result<Self> {
        let registry = AgentRegistry::new(settings.registry.clone())?;
        let protocol = CommunicationProtocol::new(registry.clone(), settings.protocol.clone())?;
        let behavior: Arc<dyn AgentBehavior> = Arc::new(EchoBehavior {
            protocol: protocol.clone(),
        });

        let mut agents = Vec::with_capacity(shards * agents_per_shard);
        for shard in 0..shards {
            let shard_id = format!("shard-{}", shard);
            for n in 0..agents_per_shard {
                let agent = Agent::builder(&shard_id, "echo")
                    .id(format!("{}-agent-{}", shard_id, n))
                    .config(settings.agent.clone())
                    .behavior(behavior.clone())
                    .build()?;
                registry.register(&agent)?;
                agent.spawn().await?;
                agents.push(agent);
            }
        }

        tracing::info!(
            shards = shards,
            agents = agents.len(),
            "Population spawned"
        );
        Ok(Self {
            registry,
            protocol,
            agents,
        })
    }

    async fn shutdown(self) {
        for agent in &self.agents {
            if let Err(e) = agent.terminate().await {
                tracing::warn!(agent_id = %agent.id(), error = %e, "Terminate failed");
            }
        }
        self.protocol.shutdown();
        self.registry.shutdown();
    }
}

#[derive(Debug, Serialize)]
struct RoundTrip {
    from: String,
    to: String,
    elapsed_ms: u64,
    response: Value,
}

#[derive(Debug, Serialize)]
struct ShardSummary {
    shard_id: String,
    agents: usize,
    round_trip: Option<RoundTrip>,
    broadcast: Option<BroadcastReport>,
}

#[derive(Debug, Serialize)]
struct DemoSummary {
    shards: Vec<ShardSummary>,
    health: HealthReport,
    protocol: ProtocolStats,
    agents: Vec<AgentSnapshot>,
}

async fn exercise_shard(population: &Population, shard_id: &str) -> Result<ShardSummary> {
    let members = population.registry.agents_by_shard(shard_id);
    let mut summary = ShardSummary {
        shard_id: shard_id.to_string(),
        agents: members.len(),
        round_trip: None,
        broadcast: None,
    };
    let Some(first) = members.first() else {
        return Ok(summary);
    };

    if let Some(second) = members.get(1) {
        let started = tokio::time::Instant::now();
        let outcome = population
            .protocol
            .send(
                first.id(),
                second.id(),
                MessageType::Request,
                json!("ping"),
                SendOptions::priority(Priority::High),
            )
            .await?;
        let response = outcome
            .into_response()
            .map(|m| m.payload)
            .unwrap_or(Value::Null);
        summary.round_trip = Some(RoundTrip {
            from: first.id().to_string(),
            to: second.id().to_string(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            response,
        });
    }

    summary.broadcast = Some(
        population
            .protocol
            .broadcast(first.id(), shard_id, json!({ "hello": shard_id }), Priority::Normal)
            .await,
    );
    Ok(summary)
}

async fn cmd_demo(shards: usize, agents_per_shard: usize, config: Option<&Path>) -> Result<()> {
    let settings = resolve_settings(config)?;
    let population = Population::spawn(&settings, shards, agents_per_shard).await?;

    let mut shard_summaries = Vec::new();
    for shard_id in population.registry.shards() {
        shard_summaries.push(exercise_shard(&population, &shard_id).await?);
    }

    // let the broadcast deliveries land before reporting
    tokio::time::sleep(Duration::from_millis(50)).await;

    let summary = DemoSummary {
        shards: shard_summaries,
        health: population.registry.run_health_check(),
        protocol: population.protocol.stats(),
        agents: population.agents.iter().map(Agent::snapshot).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    population.shutdown().await;
    Ok(())
}

async fn cmd_health(config: Option<&Path>) -> Result<()> {
    let settings = resolve_settings(config)?;
    let population = Population::spawn(&settings, 2, 3).await?;

    let report = population.registry.run_health_check();
    println!("{}", serde_json::to_string_pretty(&report)?);

    population.shutdown().await;
    Ok(())
}

fn cmd_config(config: Option<&Path>) -> Result<()> {
    let settings = resolve_settings(config)?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Commands::command().debug_assert();
    }

    #[test]
    fn test_parse_demo_args() {
        let args = Commands::try_parse_from([
            "agentshard",
            "demo",
            "--shards",
            "4",
            "--agents-per-shard",
            "2",
        ])
        .unwrap();
        match args.command {
            Command::Demo {
                shards,
                agents_per_shard,
                config,
            } => {
                assert_eq!(shards, 4);
                assert_eq!(agents_per_shard, 2);
                assert!(config.is_none());
            }
            _ => panic!("expected demo"),
        }
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(resolve_settings(Some(&missing)).is_err());
    }

    #[tokio::test]
    async fn test_echo_round_trip_and_broadcast() {
        let settings = Settings::default();
        let population = Population::spawn(&settings, 1, 3).await.unwrap();

        let summary = exercise_shard(&population, "shard-0").await.unwrap();
        assert_eq!(summary.agents, 3);

        let round_trip = summary.round_trip.unwrap();
        assert_eq!(round_trip.from, "shard-0-agent-0");
        assert_eq!(round_trip.response["echo"], "ping");
        assert_eq!(round_trip.response["by"], "shard-0-agent-1");

        let broadcast = summary.broadcast.unwrap();
        assert_eq!(broadcast.sent, 2);
        assert_eq!(broadcast.failed, 0);

        let agents = population.agents.clone();
        population.shutdown().await;
        assert!(agents.iter().all(|a| a.state() == AgentState::Terminated));
    }

    #[tokio::test]
    async fn test_single_agent_shard_skips_round_trip() {
        let population = Population::spawn(&Settings::default(), 1, 1).await.unwrap();
        let summary = exercise_shard(&population, "shard-0").await.unwrap();
        assert!(summary.round_trip.is_none());
        assert_eq!(summary.broadcast.unwrap().total(), 0);
        population.shutdown().await;
    }
}
