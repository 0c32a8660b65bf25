//! Workflow definition and execution for agent-rs orchestration
//!
//! A workflow is a set of stages with dependencies between them. The
//! [`WorkflowManager`] validates the dependency graph once, at creation, fixes
//! the execution order and then runs the stages one at a time against an
//! [`agent_core::AgentExecution`] collaborator, publishing every transition on
//! the event bus.

pub mod dag;
pub mod error;
pub mod manager;
pub mod stage;
pub mod workflow;

// Re-export for convenience
pub use dag::StageGraph;
pub use error::{Result, WorkflowError};
pub use manager::{WorkflowManager, WorkflowManagerBuilder, WorkflowManagerConfig};
pub use stage::{Stage, StageDefinition, StageState};
pub use workflow::{Workflow, WorkflowMetrics, WorkflowState};
