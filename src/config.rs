//! Configuration loading using Figment
//!
//! A model file holds the engine settings and the component declaration:
//!
//! ```yaml
//! engine:
//!   log_level: info
//!   max_workers: 4
//!   shutdown_timeout_ms: 5000
//!   retry: { max_attempts: 2, backoff_ms: 250 }
//! components:
//!   - { name: "Light", class: "simulated.Light", role: light, affects: ["Camera"] }
//!   - { name: "Camera", class: "simulated.Camera", role: ccd }
//! ```
//!
//! Files ending in `.toml` are read as TOML, anything else as YAML. The whole
//! `engine` section may be omitted.
//!
//! # Environment Variable Overrides
//!
//! Variables with the `RUSTSCOPE_` prefix override file values; nested keys are
//! separated by a double underscore:
//!
//! ```text
//! RUSTSCOPE_ENGINE__MAX_WORKERS=8
//! RUSTSCOPE_ENGINE__RETRY__MAX_ATTEMPTS=3
//! ```

use crate::component::ComponentRecord;
use crate::error::{ModelError, ModelResult};
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUSTSCOPE_";

/// Upper bound on `engine.max_workers`.
pub const MAX_WORKERS: usize = 1024;

/// Top-level model configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Declared components, in declaration order
    #[serde(default)]
    pub components: Vec<ComponentRecord>,
}

/// Orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Components constructed in parallel at most
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Time allowed for one driver shutdown, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Construction retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Policy for retrying a failed driver construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total construction attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts, in milliseconds.
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff() -> u64 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_workers: default_max_workers(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate settings
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Between one and [`MAX_WORKERS`] workers
    /// - Non-zero shutdown timeout
    /// - At least one construction attempt
    pub fn validate(&self) -> ModelResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ModelError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.max_workers == 0 {
            return Err(ModelError::Config("max_workers must be at least 1".to_string()));
        }
        if self.max_workers > MAX_WORKERS {
            return Err(ModelError::Config(format!(
                "max_workers {} exceeds the limit of {}",
                self.max_workers, MAX_WORKERS
            )));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ModelError::Config(
                "shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ModelError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ModelConfig {
    /// Load a model file (TOML or YAML by extension) with environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ModelResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::Config(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let file = if is_toml {
            Figment::new().merge(Toml::file(path))
        } else {
            Figment::new().merge(Yaml::file(path))
        };
        Self::extract(file)
    }

    /// Parse a YAML model document, with environment overrides.
    pub fn from_yaml_str(text: &str) -> ModelResult<Self> {
        Self::extract(Figment::new().merge(Yaml::string(text)))
    }

    /// Parse a TOML model document, with environment overrides.
    pub fn from_toml_str(text: &str) -> ModelResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(text)))
    }

    fn extract(source: Figment) -> ModelResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(source)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.engine.validate()?;
        Ok(config)
    }
}
