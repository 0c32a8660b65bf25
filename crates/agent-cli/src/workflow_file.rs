//! Workflow description files

use agent_core::{Payload, SecurityContext};
use agent_workflow::StageDefinition;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// An agent the `run` command registers before running the workflow
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub agent_id: String,
    pub config: Payload,
}

/// A workflow together with the agents and identity needed to run it
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    pub workflow_id: String,
    #[serde(default)]
    pub security_context: SecurityContext,
    #[serde(default)]
    pub config: Payload,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    pub stages: Vec<StageDefinition>,
}

impl WorkflowFile {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("malformed workflow file")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("in {}", path.display()))
    }
}
