//! Core abstractions for agent-rs orchestration
//!
//! This crate defines the types shared by the event bus, the workflow manager
//! and the agent coordinator: the collaborator traits, the security context,
//! retry and circuit breaker primitives, and the core error type.

pub mod agent;
pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod retry;

pub use agent::{AgentDirectory, AgentExecution, AgentMetadata};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use context::SecurityContext;
pub use error::{Error, Result, StageError};
pub use retry::{Attempted, RetryPolicy, Retryable};

/// JSON object used for payloads, stage configs and error contexts
pub type Payload = serde_json::Map<String, serde_json::Value>;
