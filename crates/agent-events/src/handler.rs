//! Subscriber side of the bus
//!
//! Every subscription owns a bounded inbound queue and a dispatch task that
//! pops events and hands them to the handler one at a time.

use crate::event::{Event, EventType};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives events for the types it was subscribed to
///
/// Delivery is at-least-once: the same event may arrive twice (for example
/// once from the local fan-out and once routed back by the transport), so
/// `handle` must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Apply one event
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Identifier returned by `subscribe`
pub type SubscriptionId = u64;

pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    pub(crate) sender: mpsc::Sender<Event>,
    pub(crate) task: JoinHandle<()>,
}

impl Subscriber {
    /// Start the dispatch task for `handler`
    pub(crate) fn spawn(
        id: SubscriptionId,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        capacity: usize,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Event>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                debug!(
                    "Dispatching {} ({}) to handler '{}'",
                    event.event_type,
                    event.correlation_id,
                    handler.name()
                );
                if let Err(e) = handler.handle(&event).await {
                    warn!(
                        "Handler '{}' failed on {} event {}: {:#}",
                        handler.name(),
                        event_type,
                        event.correlation_id,
                        e
                    );
                }
            }
            debug!("Dispatch loop for subscription {} finished", id);
        });

        Self { id, sender, task }
    }
}

/// Handler backed by an async closure
///
/// # Example
///
/// ```
/// use agent_events::{Event, FnHandler};
///
/// let handler = FnHandler::new("printer", |event: Event| async move {
///     println!("{}", event.event_type);
///     Ok::<_, anyhow::Error>(())
/// });
/// ```
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F> {
    /// Wrap `func` as a named handler
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.func)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
