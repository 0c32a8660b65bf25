//! Error types for event bus operations

use agent_core::Retryable;
use thiserror::Error;

/// Result type for event bus operations
pub type Result<T> = std::result::Result<T, EventError>;

/// Failure reported by an event transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    /// Reason reported by the transport
    pub message: String,
    /// Whether the call may succeed if repeated
    pub retryable: bool,
}

impl TransportError {
    /// Transient failure (throttling, connection reset, ...)
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent failure (bad request, missing permissions, ...)
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Errors that can occur on the event bus
#[derive(Error, Debug)]
pub enum EventError {
    /// Event type is not in the bus's registered set
    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    /// Transport call failed after all retry attempts
    #[error("Transport error during {operation} after {attempts} attempt(s): {source}")]
    Transport {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// No subscription with this id exists for the event type
    #[error("Unknown subscription {id} for event type {event_type}")]
    UnknownSubscription { event_type: String, id: u64 },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}
