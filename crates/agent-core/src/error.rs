//! Error types for agent-core

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for agent-core
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared by the orchestration crates
#[derive(Error, Debug)]
pub enum Error {
    /// Security context is missing required identity or permission fields
    #[error("Invalid security context: {0}")]
    InvalidSecurityContext(String),

    /// Circuit breaker is open; calls fail fast until the cooldown elapses
    #[error("Circuit '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// Agent execution failed
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Agent directory has no entry for the agent
    #[error("Agent not found in directory: {0}")]
    AgentNotFound(String),

    /// Agent directory lookup failed
    #[error("Agent directory lookup failed: {0}")]
    Directory(String),
}

/// Failure reported by the agent execution collaborator
///
/// `retryable` tells the retry policy whether calling the agent again can
/// help; validation-style failures should set it to `false`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Agent '{agent_id}' failed: {message}")]
pub struct StageError {
    /// Agent that produced the failure
    pub agent_id: String,
    /// Human readable reason
    pub message: String,
    /// Whether a retry may succeed
    pub retryable: bool,
    /// Structured detail forwarded into the stage's error context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    /// Create a retryable stage error
    pub fn new(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// Create a stage error that must not be retried
    pub fn fatal(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(agent_id, message)
        }
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl crate::retry::Retryable for StageError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}
