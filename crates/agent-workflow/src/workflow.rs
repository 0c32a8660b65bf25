//! Workflow model

use crate::dag::StageGraph;
use crate::stage::{Stage, StageDefinition};
use agent_core::{Payload, SecurityContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle of a workflow
///
/// `Paused` and `Recovering` are reserved: nothing in the manager moves a
/// workflow into them yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Recovering,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Pending => "PENDING",
            WorkflowState::Running => "RUNNING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Paused => "PAUSED",
            WorkflowState::Recovering => "RECOVERING",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and outcome counters for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowMetrics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time` in milliseconds
    pub duration_ms: Option<i64>,
    pub completed_stage_count: usize,
    pub failed_stage_count: usize,
}

impl WorkflowMetrics {
    pub(crate) fn start(&mut self) {
        self.start_time = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self) {
        let end = Utc::now();
        self.end_time = Some(end);
        self.duration_ms = self
            .start_time
            .map(|start| (end - start).num_milliseconds());
    }
}

/// A validated workflow and its run state
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub workflow_id: String,
    /// Stages in input order
    pub stages: Vec<Stage>,
    pub state: WorkflowState,
    pub security_context: SecurityContext,
    pub config: Payload,
    /// Stage ids in the order they run
    pub execution_order: Vec<String>,
    /// Correlation id of the current or last run
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metrics: WorkflowMetrics,
    #[serde(skip)]
    order: Vec<usize>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Workflow {
    pub(crate) fn new(
        workflow_id: String,
        definitions: Vec<StageDefinition>,
        graph: &StageGraph,
        config: Payload,
        security_context: SecurityContext,
    ) -> Self {
        let stages: Vec<Stage> = definitions.into_iter().map(Stage::from_definition).collect();
        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.stage_id.clone(), i))
            .collect();

        Self {
            workflow_id,
            stages,
            state: WorkflowState::Pending,
            security_context,
            config,
            execution_order: graph.ordered_ids(),
            run_id: None,
            created_at: Utc::now(),
            metrics: WorkflowMetrics::default(),
            order: graph.order().to_vec(),
            index,
        }
    }

    /// Look up a stage by id
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.index.get(stage_id).map(|&i| &self.stages[i])
    }

    pub(crate) fn stage_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        self.index.get(stage_id).map(|&i| &mut self.stages[i])
    }

    pub(crate) fn stage_at_mut(&mut self, index: usize) -> &mut Stage {
        &mut self.stages[index]
    }

    pub(crate) fn order(&self) -> &[usize] {
        &self.order
    }

    /// Stages in execution order
    pub fn ordered_stages(&self) -> impl Iterator<Item = &Stage> {
        self.order.iter().map(|&i| &self.stages[i])
    }

    /// Distinct agent ids referenced by the stages
    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for stage in &self.stages {
            if !ids.contains(&stage.agent_id.as_str()) {
                ids.push(&stage.agent_id);
            }
        }
        ids
    }
}
