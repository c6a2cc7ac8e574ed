//! Configuration for the swarm orchestrator.
//!
//! Configuration is a YAML file plus a few environment overrides:
//! - `SWARM_CONFIG` - Optional. Path to the YAML file. Defaults to `swarm.yaml`.
//! - `HOST` - Optional. Server host. Overrides `server.host`.
//! - `PORT` - Optional. Server port. Overrides `server.port`.
//!
//! Every tunable has a serde default, so an empty file is a valid (if
//! useless) configuration.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::Team;
use crate::capacity::ProviderBudget;
use crate::circuit::CircuitConfig;
use crate::health::HealthConfig;
use crate::provider::HttpProviderConfig;
use crate::retry::RetryPolicy;

const DEFAULT_CONFIG_PATH: &str = "swarm.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_worker_pool_size() -> usize {
    32
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_task_timeout_ms() -> u64 {
    120_000
}
fn default_result_retention_ms() -> u64 {
    600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum concurrent provider calls across the whole swarm
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Per-call timeout for agents without their own
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Task deadline when the submitter does not give one
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Refuse new tasks while the swarm is in maintenance
    #[serde(default)]
    pub reject_in_maintenance: bool,
    /// How long a finished async result waits to be polled before it is dropped
    #[serde(default = "default_result_retention_ms")]
    pub result_retention_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            call_timeout_ms: default_call_timeout_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            reject_in_maintenance: false,
            result_retention_ms: default_result_retention_ms(),
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_millis(self.result_retention_ms)
    }
}

fn default_window_secs() -> u64 {
    60
}
fn default_buckets() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_buckets")]
    pub buckets: u32,
    /// Budget for providers that do not set their own
    #[serde(default)]
    pub default_budget: ProviderBudget,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            buckets: default_buckets(),
            default_budget: ProviderBudget::default(),
        }
    }
}

impl CapacityConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// One provider ("virtual key"): its budget and, optionally, an HTTP endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<ProviderBudget>,
    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub teams: Vec<Team>,
}

impl SwarmConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SwarmConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Path named by `SWARM_CONFIG`, or the default.
    pub fn path_from_env() -> PathBuf {
        std::env::var("SWARM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from `SWARM_CONFIG` and apply `HOST` / `PORT`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, does not validate, or
    /// `PORT` is not a number.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::load(&Self::path_from_env())?;

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "orchestrator.worker_pool_size".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.call_timeout_ms == 0
            || self.orchestrator.task_timeout_ms == 0
            || self.orchestrator.result_retention_ms == 0
        {
            return Err(ConfigError::Invalid(
                "orchestrator timeouts must be greater than zero".to_string(),
            ));
        }
        if self.capacity.window_secs == 0 || self.capacity.buckets == 0 {
            return Err(ConfigError::Invalid(
                "capacity window and bucket count must be greater than zero".to_string(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "circuit.failure_threshold".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        self.health.validate().map_err(ConfigError::Invalid)?;
        self.retry.validate().map_err(ConfigError::Invalid)?;

        let providers: HashSet<String> = self.providers.keys().cloned().collect();
        let mut names = HashSet::new();
        for team in &self.teams {
            if !names.insert(team.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate team name '{}'",
                    team.name
                )));
            }
            team.validate(&providers).map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    /// Budget for `provider`, falling back to the default budget.
    pub fn budget_for(&self, provider: &str) -> ProviderBudget {
        self.providers
            .get(provider)
            .and_then(|p| p.budget)
            .unwrap_or(self.capacity.default_budget)
    }

    /// HTTP client settings for every provider with an endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if a provider names an API key
    /// variable that is not set.
    pub fn http_providers(&self) -> Result<Vec<HttpProviderConfig>, ConfigError> {
        let mut out = Vec::new();
        for (id, provider) in &self.providers {
            let Some(base_url) = &provider.base_url else {
                continue;
            };
            let model = provider.model.clone().ok_or_else(|| {
                ConfigError::InvalidValue(
                    format!("providers.{}.model", id),
                    "required when base_url is set".to_string(),
                )
            })?;
            let api_key = match &provider.api_key_env {
                Some(var) => Some(
                    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.clone()))?,
                ),
                None => None,
            };
            out.push(HttpProviderConfig {
                id: id.clone(),
                base_url: base_url.clone(),
                model,
                api_key,
            });
        }
        Ok(out)
    }
}
