//! Agent coordination for agent-rs orchestration
//!
//! The [`AgentCoordinator`] is the front door of the orchestrator. It keeps
//! the agent registry and the resource ledger, refuses to run a workflow whose
//! agents are not all active, and keeps the workflow manager in step with the
//! stage events it receives from the bus.

pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod registry;
pub mod resources;

// Re-export for convenience
pub use coordinator::{AgentCoordinator, AgentCoordinatorBuilder, CoordinatorConfig};
pub use error::{CoordinatorError, Result};
pub use handlers::{StageEventHandler, WorkflowCounters, WorkflowEventHandler};
pub use health::{AgentCounts, DEGRADED_UTILIZATION, HealthReport, HealthStatus};
pub use registry::{AgentRegistration, AgentSpec, AgentStatus};
pub use resources::{ResourceAllocation, ResourceLedger, ResourceUsage};
