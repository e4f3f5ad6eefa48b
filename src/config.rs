//! Configuration loading for agentshard.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Get the agentshard home directory (~/.agentshard).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentshard"))
}

/// Get the default settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from a JSON file. Missing sections and fields take their defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings from `path` (or the default location) or fall back to defaults.
pub fn load_settings_or_default(path: Option<&Path>) -> Settings {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match get_settings_path() {
            Ok(p) if p.exists() => p,
            _ => return Settings::default(),
        },
    };

    load_settings(&path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    settings.agent.validate()?;
    settings.registry.validate()?;
    settings.protocol.validate()?;
    Ok(())
}

fn require_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

/// Per-agent options.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_max_log_entries() -> usize {
    1000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_positive("agent.heartbeat_interval_ms", self.heartbeat_interval_ms)?;
        require_positive("agent.max_log_entries", self.max_log_entries as u64)
    }
}

/// Registry options.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegistryConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_max_agents_per_shard")]
    pub max_agents_per_shard: usize,
}

fn default_health_check_interval_ms() -> u64 {
    60_000
}

fn default_max_agents_per_shard() -> usize {
    1000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            max_agents_per_shard: default_max_agents_per_shard(),
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_positive(
            "registry.health_check_interval_ms",
            self.health_check_interval_ms,
        )?;
        require_positive(
            "registry.max_agents_per_shard",
            self.max_agents_per_shard as u64,
        )
    }
}

/// Messaging protocol options.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_message_timeout_ms() -> u64 {
    120_000
}

fn default_rate_limit_per_minute() -> u32 {
    100
}

fn default_gc_interval_ms() -> u64 {
    60_000
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            message_timeout_ms: default_message_timeout_ms(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            gc_interval_ms: default_gc_interval_ms(),
        }
    }
}

impl ProtocolConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_positive("protocol.max_queue_size", self.max_queue_size as u64)?;
        require_positive("protocol.message_timeout_ms", self.message_timeout_ms)?;
        require_positive(
            "protocol.rate_limit_per_minute",
            self.rate_limit_per_minute as u64,
        )?;
        require_positive("protocol.gc_interval_ms", self.gc_interval_ms)
    }
}

/// agentshard settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,
}
