//! Error types for the agent coordinator

use agent_events::EventError;
use agent_workflow::WorkflowError;
use std::time::Duration;
use thiserror::Error;

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors that can occur in the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Agent config is missing a required key or has a malformed value
    #[error("Invalid config for agent '{agent_id}': {reason}")]
    InvalidAgentConfig { agent_id: String, reason: String },

    #[error("Agent already registered: {0}")]
    AgentAlreadyRegistered(String),

    /// Agent is unknown to the coordinator or not active
    #[error("Agent not registered or inactive: {0}")]
    AgentNotRegistered(String),

    /// Agent directory has no entry for the agent
    #[error("Agent not found in directory: {0}")]
    AgentNotFound(String),

    /// Granting the request would exceed the configured capacity
    #[error(
        "Insufficient {resource_type}: requested {requested}, available {available} of {capacity}"
    )]
    InsufficientResources {
        resource_type: String,
        requested: f64,
        available: f64,
        capacity: f64,
    },

    #[error("Invalid security context: {0}")]
    InvalidSecurityContext(String),

    /// Directory lookups are suspended by the circuit breaker
    #[error("Directory circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Agent directory lookup failed
    #[error("Agent directory error: {0}")]
    Directory(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Event(#[from] EventError),

    /// Coordinator is missing a required component
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl CoordinatorError {
    /// Whether a circuit breaker, directory or workflow, refused the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::Workflow(WorkflowError::CircuitOpen { .. })
        )
    }
}

impl From<agent_core::Error> for CoordinatorError {
    fn from(err: agent_core::Error) -> Self {
        match err {
            agent_core::Error::InvalidSecurityContext(msg) => Self::InvalidSecurityContext(msg),
            agent_core::Error::CircuitOpen { retry_after, .. } => Self::CircuitOpen { retry_after },
            agent_core::Error::AgentNotFound(id) => Self::AgentNotFound(id),
            agent_core::Error::Directory(msg) => Self::Directory(msg),
            other => Self::Directory(other.to_string()),
        }
    }
}
