//! Agent registrations

use crate::error::{CoordinatorError, Result};
use crate::resources::ResourceAllocation;
use agent_core::{AgentMetadata, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Whether an agent may take part in workflow runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => f.write_str("ACTIVE"),
            AgentStatus::Inactive => f.write_str("INACTIVE"),
        }
    }
}

/// The required part of an agent config
///
/// Other keys of the config are kept on the registration untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub capabilities: Vec<String>,
    /// Amount of each resource type the agent holds while active
    pub resource_requirements: BTreeMap<String, f64>,
}

impl AgentSpec {
    /// Parse and check the required keys of an agent config
    pub fn from_config(agent_id: &str, config: &Payload) -> Result<Self> {
        let invalid = |reason: String| CoordinatorError::InvalidAgentConfig {
            agent_id: agent_id.to_string(),
            reason,
        };

        let spec: AgentSpec = serde_json::from_value(serde_json::Value::Object(config.clone()))
            .map_err(|e| invalid(e.to_string()))?;

        if spec.agent_type.trim().is_empty() {
            return Err(invalid("type must not be empty".to_string()));
        }
        for (resource_type, amount) in &spec.resource_requirements {
            if !amount.is_finite() || *amount < 0.0 {
                return Err(invalid(format!(
                    "resource requirement '{resource_type}' must be a non-negative number, got {amount}"
                )));
            }
        }
        Ok(spec)
    }
}

/// A registered agent and the resources it holds
#[derive(Debug, Clone, Serialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub config: Payload,
    pub spec: AgentSpec,
    pub status: AgentStatus,
    pub resources: BTreeMap<String, ResourceAllocation>,
    pub registered_at: DateTime<Utc>,
    /// Directory entry, when a directory is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AgentMetadata>,
}

impl AgentRegistration {
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// Amount held of one resource type
    pub fn allocated(&self, resource_type: &str) -> f64 {
        self.resources.get(resource_type).map_or(0.0, |a| a.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_spec() {
        let spec = AgentSpec::from_config(
            "summarizer",
            &config(json!({
                "type": "llm",
                "capabilities": ["summarize"],
                "resource_requirements": {"cpu": 2, "memory_mb": 512.5},
                "model": "small"
            })),
        )
        .unwrap();

        assert_eq!(spec.agent_type, "llm");
        assert_eq!(spec.resource_requirements["cpu"], 2.0);
        assert_eq!(spec.resource_requirements["memory_mb"], 512.5);
    }

    #[test]
    fn test_missing_key() {
        let err = AgentSpec::from_config(
            "a",
            &config(json!({"type": "llm", "capabilities": []})),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::InvalidAgentConfig { reason, .. } if reason.contains("resource_requirements")
        ));
    }

    #[test]
    fn test_bad_values() {
        for bad in [
            json!({"type": "llm", "capabilities": "all", "resource_requirements": {}}),
            json!({"type": "", "capabilities": [], "resource_requirements": {}}),
            json!({"type": "llm", "capabilities": [], "resource_requirements": {"cpu": -1}}),
            json!({"type": "llm", "capabilities": [], "resource_requirements": {"cpu": "two"}}),
        ] {
            assert!(AgentSpec::from_config("a", &config(bad)).is_err());
        }
    }
}
