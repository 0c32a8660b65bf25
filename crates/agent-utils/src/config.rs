//! Configuration management utilities
//!
//! The orchestrator reads a single JSON document. Every section is optional
//! and falls back to its defaults, so an empty `{}` is a valid configuration.
//!
//! # Example
//!
//! ```json
//! {
//!   "event_bus": { "batch_size": 10, "batch_max_age_seconds": 5.0 },
//!   "circuit_breaker": { "failure_threshold": 5, "recovery_timeout_seconds": 60 },
//!   "resource_capacity": { "cpu": 8.0, "memory_mb": 16384.0 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "AGENT_ORCHESTRATOR_";

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the expected schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override could not be parsed
    #[error("Invalid value for {key}: '{value}'")]
    InvalidOverride { key: String, value: String },

    /// A value is out of its allowed range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retry settings shared by transport publishing and stage execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum attempts including the first call
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound for any single backoff
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive backoffs
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusSettings {
    /// Queue length that triggers a flush
    pub batch_size: usize,
    /// Age of the oldest queued event that triggers a flush
    pub batch_max_age_seconds: f64,
    /// Interval of the background flush loop
    pub flush_interval_ms: u64,
    /// Bounded inbound queue per subscriber
    pub subscriber_queue_capacity: usize,
    /// Route target announced to the transport when subscribing
    pub route_target: String,
    /// Fan out successfully sent events to in-process subscribers
    pub local_dispatch: bool,
    /// Retry policy for immediate publishes
    pub publish_retry: RetrySettings,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_max_age_seconds: 5.0,
            flush_interval_ms: 500,
            subscriber_queue_capacity: 256,
            route_target: "agent-orchestrator".to_string(),
            local_dispatch: true,
            publish_retry: RetrySettings::default(),
        }
    }
}

impl EventBusSettings {
    /// Max age as a duration
    pub fn batch_max_age(&self) -> Duration {
        Duration::from_secs_f64(self.batch_max_age_seconds)
    }

    /// Flush interval as a duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Time the breaker stays open before letting a trial call through
    pub recovery_timeout_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
        }
    }
}

/// Workflow manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Lifetime of a workflow in the in-memory cache
    pub cache_ttl_seconds: u64,
    /// Retry policy for a single stage execution
    pub stage_retry: RetrySettings,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 3600,
            stage_retry: RetrySettings::default(),
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Interval of the periodic health loop
    pub health_check_interval_seconds: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: 30,
        }
    }
}

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus batching and delivery
    pub event_bus: EventBusSettings,
    /// Circuit breaker shared by the workflow manager and the coordinator
    pub circuit_breaker: CircuitBreakerSettings,
    /// Capacity per resource type
    pub resource_capacity: HashMap<String, f64>,
    /// Workflow manager
    pub workflow: WorkflowSettings,
    /// Coordinator loops
    pub coordinator: CoordinatorSettings,
    /// Log output
    pub logging: LoggingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_bus: EventBusSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            resource_capacity: HashMap::from([
                ("cpu".to_string(), 8.0),
                ("memory_mb".to_string(), 16_384.0),
            ]),
            workflow: WorkflowSettings::default(),
            coordinator: CoordinatorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Config {
    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Load the effective configuration
    ///
    /// Reads `path` when given (defaults otherwise), applies
    /// `AGENT_ORCHESTRATOR_*` environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup
    ///
    /// Keys are the `ENV_PREFIX`-prefixed names below. Resource capacities
    /// use `AGENT_ORCHESTRATOR_CAPACITY_<TYPE>` for every type already
    /// present in the configuration.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("BATCH_SIZE") {
            self.event_bus.batch_size = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("BATCH_MAX_AGE_SECONDS") {
            self.event_bus.batch_max_age_seconds = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("RECOVERY_TIMEOUT_SECONDS") {
            self.circuit_breaker.recovery_timeout_seconds = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("WORKFLOW_TTL_SECONDS") {
            self.workflow.cache_ttl_seconds = parse_override(&key, &value)?;
        }
        if let Some((_, value)) = get("LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some((key, value)) = get("LOG_FORMAT") {
            self.logging.format = match value.to_ascii_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => return Err(ConfigError::InvalidOverride { key, value }),
            };
        }

        let resource_types: Vec<String> = self.resource_capacity.keys().cloned().collect();
        for resource_type in resource_types {
            let name = format!("CAPACITY_{}", resource_type.to_ascii_uppercase());
            if let Some((key, value)) = get(&name) {
                let amount = parse_override(&key, &value)?;
                self.resource_capacity.insert(resource_type, amount);
            }
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_bus.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "event_bus.batch_size must be greater than 0".to_string(),
            ));
        }
        if !(self.event_bus.batch_max_age_seconds.is_finite()
            && self.event_bus.batch_max_age_seconds > 0.0)
        {
            return Err(ConfigError::Invalid(
                "event_bus.batch_max_age_seconds must be a positive number".to_string(),
            ));
        }
        if self.event_bus.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "event_bus.flush_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.event_bus.subscriber_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_bus.subscriber_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.coordinator.health_check_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.health_check_interval_seconds must be greater than 0".to_string(),
            ));
        }
        for (name, retry) in [
            ("event_bus.publish_retry", &self.event_bus.publish_retry),
            ("workflow.stage_retry", &self.workflow.stage_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.max_attempts must be greater than 0"
                )));
            }
            if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.backoff_multiplier must be at least 1.0"
                )));
            }
        }
        for (resource_type, capacity) in &self.resource_capacity {
            if !(capacity.is_finite() && *capacity >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "resource_capacity.{resource_type} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}
