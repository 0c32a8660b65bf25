//! Error types for workflow definition and execution

use crate::workflow::WorkflowState;
use agent_core::StageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors that can occur while defining or running workflows
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// A stage depends on a stage id that is not part of the workflow
    #[error("Stage '{stage_id}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage_id: String, dependency: String },

    /// The dependency graph contains a cycle
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Two stages share the same id
    #[error("Duplicate stage id: {0}")]
    DuplicateStage(String),

    /// Security context lacks identity or permissions
    #[error("Invalid security context: {0}")]
    InvalidSecurityContext(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow already exists: {0}")]
    WorkflowExists(String),

    #[error("Workflow '{workflow_id}' has no stage '{stage_id}'")]
    UnknownStage {
        workflow_id: String,
        stage_id: String,
    },

    /// Only pending workflows can be executed
    #[error("Workflow '{workflow_id}' cannot run from state {state}")]
    NotRunnable {
        workflow_id: String,
        state: WorkflowState,
    },

    /// Stage execution is suspended by the circuit breaker
    #[error("Circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// A stage failed after all retry attempts
    #[error("Stage '{stage_id}' of workflow '{workflow_id}' failed: {source}")]
    StageFailed {
        workflow_id: String,
        stage_id: String,
        #[source]
        source: StageError,
    },

    /// Manager is missing a required component
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Error from the shared core types
    #[error(transparent)]
    Core(agent_core::Error),
}

impl From<agent_core::Error> for WorkflowError {
    fn from(err: agent_core::Error) -> Self {
        match err {
            agent_core::Error::InvalidSecurityContext(msg) => Self::InvalidSecurityContext(msg),
            agent_core::Error::CircuitOpen { retry_after, .. } => Self::CircuitOpen { retry_after },
            other => Self::Core(other),
        }
    }
}

impl WorkflowError {
    /// Whether the error reports a caller defect rather than a runtime failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownDependency { .. }
                | Self::CyclicDependency { .. }
                | Self::DuplicateStage(_)
                | Self::InvalidSecurityContext(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message() {
        let err = WorkflowError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
        assert!(err.is_validation());
    }

    #[test]
    fn test_from_core_error() {
        let err: WorkflowError = agent_core::Error::CircuitOpen {
            name: "workflow".into(),
            retry_after: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(err, WorkflowError::CircuitOpen { retry_after } if retry_after.as_secs() == 3));

        let err: WorkflowError = agent_core::Error::InvalidSecurityContext("no user".into()).into();
        assert!(matches!(err, WorkflowError::InvalidSecurityContext(_)));
    }
}
