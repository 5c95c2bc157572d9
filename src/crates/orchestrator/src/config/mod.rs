//! Orchestrator configuration
//!
//! Loaded from a TOML file (`orchestrator.toml` by default). Every section
//! has defaults, so an empty file is a valid configuration. `${ENV:default}`
//! placeholders are expanded before parsing, and `ORCHESTRATOR_DATABASE_URL`
//! and `ORCHESTRATOR_LOG` override the parsed values.

pub mod loader;

pub use loader::expand_env;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::executor::RetryConfig;
use crate::OrchestratorError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite:orchestrator.db`
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:orchestrator.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Cache TTLs and the local retry policy for cache writes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub task_ttl_secs: u64,
    pub cancel_marker_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: 3600,
            cancel_marker_ttl_secs: 86_400,
            lock_ttl_secs: 60,
            retry: RetryConfig::new(3)
                .with_initial_backoff(50)
                .with_max_backoff(2_000),
        }
    }
}

impl CacheConfig {
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn cancel_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.cancel_marker_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Dispatch and worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Steps executing at once across all tasks
    pub max_concurrent_steps: usize,
    pub step_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Attempts of a read-modify-write before giving up on a version conflict
    pub max_version_retries: u32,
    /// Backoff applied before re-running a retried step
    pub step_retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            step_timeout_secs: 300,
            sweep_interval_secs: 15,
            max_version_retries: 8,
            step_retry: RetryConfig::new(3)
                .with_initial_backoff(500)
                .with_max_backoff(30_000),
        }
    }
}

impl SchedulerConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Lifetime of a pending checkpoint; `0` means it never expires
    pub default_timeout_secs: u64,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Recent events kept per task for replay
    pub history_size: usize,
    /// How long a finished task's history and channel outlive it
    pub retention_secs: u64,
}

impl EventsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            retention_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub poll_interval_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `task_orchestrator=debug`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub checkpoints: CheckpointSettings,
    pub events: EventsConfig,
    pub automation: AutomationConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Parse TOML text after expanding placeholders
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&expand_env(content))?;
        Ok(config)
    }

    /// Load, override from the environment, and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = loader::read_expanded(path)?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `CONFIG_PATH`, then `./orchestrator.toml`, then
    /// `config/orchestrator.toml`; defaults if none exists
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            return Self::load(path);
        }

        let candidates = [
            PathBuf::from("orchestrator.toml"),
            PathBuf::from("config/orchestrator.toml"),
        ];
        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ORCHESTRATOR_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(level) = std::env::var("ORCHESTRATOR_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url is empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_steps == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_steps must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_version_retries == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_version_retries must be at least 1".to_string(),
            ));
        }
        if self.events.history_size == 0 {
            return Err(ConfigError::Invalid(
                "events.history_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configuration suited to tests: in-memory database, no backoff delays
    pub fn for_tests() -> Self {
        let mut config = Self::default();
        config.database.url = "sqlite::memory:".to_string();
        config.database.max_connections = 1;
        config.cache.retry = RetryConfig::new(2).with_initial_backoff(1).with_jitter(false);
        config.scheduler.step_retry = RetryConfig::new(0).with_initial_backoff(0).with_jitter(false);
        config.scheduler.step_timeout_secs = 5;
        config
    }
}
