//! Event bus for agent-rs orchestration
//!
//! Components communicate through typed [`Event`]s. The [`EventBus`] publishes
//! them through an [`EventTransport`], batching low-priority events per type,
//! and fans them out to local [`EventHandler`]s.
//!
//! # Example
//!
//! ```no_run
//! use agent_events::{EventBus, EventBusConfig, EventType, InMemoryTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> agent_events::Result<()> {
//! let bus = Arc::new(EventBus::new(
//!     Arc::new(InMemoryTransport::new()),
//!     EventBusConfig::default(),
//! ));
//! bus.start().await;
//!
//! bus.publish(EventType::HealthCheck, Default::default(), true).await?;
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod error;
pub mod event;
pub mod handler;
pub mod transport;

pub use bus::{EventBus, EventBusConfig, PublishReceipt};
pub use error::{EventError, Result, TransportError};
pub use event::{Event, EventType};
pub use handler::{EventHandler, FnHandler, SubscriptionId};
pub use transport::{EventTransport, InMemoryTransport, Route, SentEvent};
