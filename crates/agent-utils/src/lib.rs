//! Shared utilities for agent-rs
//!
//! This crate provides common functionality used across the agent-rs workspace:
//! the orchestrator configuration model and logging setup.

pub mod config;
pub mod logging;

pub use config::{
    CircuitBreakerSettings, Config, ConfigError, CoordinatorSettings, EventBusSettings, LogFormat,
    LoggingSettings, RetrySettings, WorkflowSettings,
};
pub use logging::{init_tracing, init_tracing_with};
