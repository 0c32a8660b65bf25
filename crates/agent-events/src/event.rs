//! Event model

use crate::error::{EventError, Result};
use agent_core::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State-change notifications the orchestrator knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AgentRegistered,
    AgentDeregistered,
    AgentStatusChanged,
    WorkflowCreated,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    StageStarted,
    StageCompleted,
    StageFailed,
    HealthCheck,
    /// A batch was dropped after its retry flush failed
    EventsDropped,
}

impl EventType {
    /// Every known event type
    pub const ALL: [EventType; 12] = [
        EventType::AgentRegistered,
        EventType::AgentDeregistered,
        EventType::AgentStatusChanged,
        EventType::WorkflowCreated,
        EventType::WorkflowStarted,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::StageStarted,
        EventType::StageCompleted,
        EventType::StageFailed,
        EventType::HealthCheck,
        EventType::EventsDropped,
    ];

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::AgentRegistered => "AGENT_REGISTERED",
            EventType::AgentDeregistered => "AGENT_DEREGISTERED",
            EventType::AgentStatusChanged => "AGENT_STATUS_CHANGED",
            EventType::WorkflowCreated => "WORKFLOW_CREATED",
            EventType::WorkflowStarted => "WORKFLOW_STARTED",
            EventType::WorkflowCompleted => "WORKFLOW_COMPLETED",
            EventType::WorkflowFailed => "WORKFLOW_FAILED",
            EventType::StageStarted => "STAGE_STARTED",
            EventType::StageCompleted => "STAGE_COMPLETED",
            EventType::StageFailed => "STAGE_FAILED",
            EventType::HealthCheck => "HEALTH_CHECK",
            EventType::EventsDropped => "EVENTS_DROPPED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::InvalidEventType(s.to_string()))
    }
}

/// An immutable state-change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: Payload,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create an event with a fresh correlation id
    pub fn new(event_type: EventType, payload: Payload) -> Self {
        Self::with_correlation(event_type, payload, uuid::Uuid::new_v4().to_string())
    }

    /// Create an event tied to an existing correlation id
    pub fn with_correlation(
        event_type: EventType,
        payload: Payload,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            payload,
            correlation_id: correlation_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Read a string field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Transport representation of the event
    pub fn to_detail(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild an event from its transport representation
    pub fn from_detail(detail: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(detail)?)
    }
}
