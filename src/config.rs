use std::{path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{action::ActionPrecedence, browser::BLANK_PAGE, error::ConfigError};

pub const ENV_MAX_STEPS: &str = "ARENA_MAX_STEPS";
pub const ENV_MAX_RECENT_STEPS: &str = "ARENA_MAX_RECENT_STEPS";
pub const ENV_TEMPERATURE: &str = "ARENA_TEMPERATURE";
pub const ENV_COINGECKO_API_KEY: &str = "COINGECKO_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub min_interval_ms: u64,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
}

impl SourceConfig {
    pub const fn new(min_interval_ms: u64, batch_size: usize) -> Self {
        Self {
            min_interval_ms,
            batch_size,
            request_timeout_secs: 30,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::new(500, 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub hackernews: SourceConfig,
    pub coingecko: SourceConfig,
    pub stooq: SourceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coingecko_api_key: Option<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            hackernews: SourceConfig::new(500, 10),
            coingecko: SourceConfig::new(2_000, 1),
            stooq: SourceConfig::new(500, 1),
            coingecko_api_key: None,
        }
    }
}

/// Run-level settings. Every field has a default so partial YAML is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub max_steps: usize,
    pub max_recent_steps: usize,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub start_url: String,
    pub action_precedence: ActionPrecedence,
    pub llm_error_wait_secs: f64,
    pub parse_failure_wait_secs: f64,
    /// Mean subtask score at or above which an evaluation counts as a success.
    pub success_threshold: f64,
    pub sources: SourcesConfig,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_recent_steps: 5,
            temperature: 0.7,
            seed: None,
            start_url: BLANK_PAGE.to_string(),
            action_precedence: ActionPrecedence::default(),
            llm_error_wait_secs: 1.0,
            parse_failure_wait_secs: 0.5,
            success_threshold: 0.8,
            sources: SourcesConfig::default(),
        }
    }
}

impl ArenaConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup. Empty values are ignored.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = lookup(ENV_MAX_STEPS) {
            self.max_steps = parse_env(ENV_MAX_STEPS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_RECENT_STEPS) {
            self.max_recent_steps = parse_env(ENV_MAX_RECENT_STEPS, &value)?;
        }
        if let Some(value) = lookup(ENV_TEMPERATURE) {
            self.temperature = parse_env(ENV_TEMPERATURE, &value)?;
        }
        if let Some(value) = lookup(ENV_COINGECKO_API_KEY) {
            self.sources.coingecko_api_key = Some(value.trim().to_string());
        }
        Ok(self)
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}
