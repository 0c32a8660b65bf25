//! Collaborator contracts for running and resolving agents
//!
//! The orchestrator never talks to an agent backend directly. Stage execution
//! goes through [`AgentExecution`], and registration-time metadata comes from
//! an optional [`AgentDirectory`].

use crate::{Payload, Result, SecurityContext, StageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Executes a single workflow stage on an agent
///
/// Implementations must be safe to call repeatedly with the same input: the
/// workflow manager retries failed calls and does not deduplicate them.
/// Implementations also own any execution timeout and must return an error
/// instead of hanging.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentExecution: Send + Sync {
    /// Run `stage_config` on `agent_id` and return the stage output
    async fn execute(
        &self,
        agent_id: &str,
        stage_config: &Payload,
        security_context: &SecurityContext,
    ) -> std::result::Result<serde_json::Value, StageError>;
}

/// Metadata the directory holds about an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Agent identifier
    pub agent_id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Owner of the agent definition
    #[serde(default)]
    pub owner: Option<String>,
    /// Anything else the directory stores
    #[serde(default)]
    pub attributes: Payload,
}

/// Resolves agent ids to their stored metadata
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Look up an agent; `Ok(None)` when the directory has no such agent
    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentMetadata>>;
}
