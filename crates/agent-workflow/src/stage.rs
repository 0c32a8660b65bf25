//! Stage model

use agent_core::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Completed | StageState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Pending => "PENDING",
            StageState::Running => "RUNNING",
            StageState::Completed => "COMPLETED",
            StageState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage as supplied by the caller
///
/// # Example
///
/// ```
/// use agent_workflow::StageDefinition;
///
/// let report = StageDefinition::new("report", "writer")
///     .depends_on("fetch")
///     .depends_on("analyze");
/// assert_eq!(report.dependencies, vec!["fetch", "analyze"]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub stage_id: String,
    pub agent_id: String,
    #[serde(default, alias = "config")]
    pub stage_config: Payload,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl StageDefinition {
    /// Create a stage with no config and no dependencies
    pub fn new(stage_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            agent_id: agent_id.into(),
            stage_config: Payload::new(),
            dependencies: Vec::new(),
        }
    }

    /// Set the config handed to the agent
    pub fn with_config(mut self, stage_config: Payload) -> Self {
        self.stage_config = stage_config;
        self
    }

    /// Add a dependency on another stage
    pub fn depends_on(mut self, stage_id: impl Into<String>) -> Self {
        self.dependencies.push(stage_id.into());
        self
    }
}

/// A stage inside a stored workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub stage_id: String,
    pub agent_id: String,
    pub stage_config: Payload,
    /// Dependency ids in first-seen order, without duplicates
    pub dependencies: Vec<String>,
    pub state: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Number of agent calls made for this stage
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub(crate) fn from_definition(definition: StageDefinition) -> Self {
        let mut dependencies: Vec<String> = Vec::with_capacity(definition.dependencies.len());
        for dependency in definition.dependencies {
            if !dependencies.contains(&dependency) {
                dependencies.push(dependency);
            }
        }

        Self {
            stage_id: definition.stage_id,
            agent_id: definition.agent_id,
            stage_config: definition.stage_config,
            dependencies,
            state: StageState::Pending,
            error_context: None,
            output: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = StageState::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, output: serde_json::Value, attempts: u32) {
        self.state = StageState::Completed;
        self.output = Some(output);
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, error_context: Payload, attempts: u32) {
        self.state = StageState::Failed;
        self.error_context = Some(error_context);
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }
}
