//! Health aggregation

use crate::resources::ResourceUsage;
use agent_core::{CircuitSnapshot, CircuitState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Utilisation at or above which a resource degrades health
pub const DEGRADED_UTILIZATION: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentCounts {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub agents: AgentCounts,
    pub resources: Vec<ResourceUsage>,
    pub workflow_circuit: CircuitSnapshot,
    pub directory_circuit: CircuitSnapshot,
    pub tracked_workflows: usize,
    pub pending_events: usize,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// Derive the overall status
    ///
    /// An open workflow breaker means no stage can run. Anything short of
    /// that (a half-open or open directory breaker, a nearly full resource)
    /// only degrades.
    pub fn evaluate(
        workflow_circuit: &CircuitSnapshot,
        directory_circuit: &CircuitSnapshot,
        resources: &[ResourceUsage],
    ) -> Self {
        if workflow_circuit.state == CircuitState::Open {
            return HealthStatus::Unhealthy;
        }
        let breaker_trouble = workflow_circuit.state != CircuitState::Closed
            || directory_circuit.state != CircuitState::Closed;
        let saturated = resources
            .iter()
            .any(|r| r.capacity > 0.0 && r.utilization >= DEGRADED_UTILIZATION);

        if breaker_trouble || saturated {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
