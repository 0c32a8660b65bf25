//! Event bus: batching publisher and local fan-out
//!
//! Publishing goes to an [`EventTransport`]. Immediate publishes are retried
//! with exponential backoff; batched publishes sit in a per-type queue until
//! the queue is full or its oldest event is too old, then the whole queue is
//! sent as one `send_batch` call.
//!
//! Subscriptions are local handlers. The first subscription for a type
//! creates a transport route so events published elsewhere are delivered back
//! into this process through [`EventBus::deliver`]; the last unsubscription
//! removes it.

use crate::error::{EventError, Result};
use crate::event::{Event, EventType};
use crate::handler::{EventHandler, Subscriber, SubscriptionId};
use crate::transport::EventTransport;
use agent_core::{Payload, RetryPolicy};
use agent_utils::EventBusSettings;
use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Queue length that triggers a flush
    pub batch_size: usize,
    /// Age of the oldest queued event that triggers a flush
    pub batch_max_age: Duration,
    /// Tick of the background flush loop
    pub flush_interval: Duration,
    /// Inbound queue capacity per subscriber
    pub subscriber_queue_capacity: usize,
    /// Target passed to `create_route`
    pub route_target: String,
    /// Prefix of route rule names
    pub rule_prefix: String,
    /// Fan out sent events to local subscribers
    pub local_dispatch: bool,
    /// Retry policy for immediate sends and route management
    pub retry: RetryPolicy,
    /// Event types this bus accepts
    pub event_types: HashSet<EventType>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::from(&EventBusSettings::default())
    }
}

impl From<&EventBusSettings> for EventBusConfig {
    fn from(settings: &EventBusSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            batch_max_age: settings.batch_max_age(),
            flush_interval: settings.flush_interval(),
            subscriber_queue_capacity: settings.subscriber_queue_capacity.max(1),
            route_target: settings.route_target.clone(),
            rule_prefix: "agent-orchestrator".to_string(),
            local_dispatch: settings.local_dispatch,
            retry: RetryPolicy::from(&settings.publish_retry),
            event_types: EventType::ALL.into_iter().collect(),
        }
    }
}

/// What happened to a published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishReceipt {
    /// Sent on its own; the transport's acknowledgement id
    Sent(String),
    /// Waiting in its type's queue
    Queued { pending: usize },
    /// Completed its queue, which was sent as one batch
    Flushed(Vec<String>),
}

#[derive(Debug)]
struct QueuedEvent {
    event: Event,
    enqueued_at: Instant,
    requeued: bool,
}

enum FlushOutcome {
    Sent(Vec<String>),
    Requeued { pending: usize },
    Dropped,
}

#[derive(Default)]
struct TypeSubscriptions {
    route_id: Option<String>,
    subscribers: Vec<Subscriber>,
}

/// Publish/subscribe bus with per-type batching
pub struct EventBus {
    config: EventBusConfig,
    transport: Arc<dyn EventTransport>,
    queues: Mutex<HashMap<EventType, VecDeque<QueuedEvent>>>,
    subscriptions: RwLock<HashMap<EventType, TypeSubscriptions>>,
    next_subscription_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create a bus publishing through `transport`
    pub fn new(transport: Arc<dyn EventTransport>, config: EventBusConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            transport,
            queues: Mutex::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            shutdown,
            flush_task: Mutex::new(None),
        }
    }

    /// Get a reference to the bus configuration
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Start the background flush loop
    ///
    /// Calling `start` on a running bus is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.flush_task.lock().await;
        if task.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.config.flush_interval;

        *task = Some(tokio::spawn(async move {
            if *shutdown_rx.borrow_and_update() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(bus) = weak.upgrade() else { break };
                        let flushed = bus.flush_due().await;
                        if flushed > 0 {
                            debug!("Flush loop sent {} queued event(s)", flushed);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Event bus flush loop stopped");
        }));
        info!(
            "Event bus flush loop started (interval {:?}, batch size {}, max age {:?})",
            interval, self.config.batch_size, self.config.batch_max_age
        );
    }

    /// Publish an event of `event_type`
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: Payload,
        batch: bool,
    ) -> Result<PublishReceipt> {
        self.publish_event(Event::new(event_type, payload), batch)
            .await
    }

    /// Publish an event whose type is given by wire name
    pub async fn publish_named(
        &self,
        event_type: &str,
        payload: Payload,
        batch: bool,
    ) -> Result<PublishReceipt> {
        let event_type: EventType = event_type.parse()?;
        self.publish(event_type, payload, batch).await
    }

    /// Publish a pre-built event, keeping its correlation id
    pub async fn publish_event(&self, event: Event, batch: bool) -> Result<PublishReceipt> {
        self.ensure_registered(event.event_type)?;

        if batch {
            self.enqueue(event).await
        } else {
            self.send_now(event).await.map(PublishReceipt::Sent)
        }
    }

    /// Register a local handler for `event_type`
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.ensure_registered(event_type)?;

        let mut subscriptions = self.subscriptions.write().await;
        let needs_route = subscriptions
            .get(&event_type)
            .is_none_or(|s| s.route_id.is_none());

        let new_route = if needs_route {
            let rule_name = self.rule_name(event_type);
            let outcome = self
                .config
                .retry
                .execute("create_route", || {
                    self.transport.create_route(
                        &rule_name,
                        event_type.as_str(),
                        &self.config.route_target,
                    )
                })
                .await;
            match outcome.result {
                Ok(route_id) => {
                    info!("Created route {} for {}", route_id, event_type);
                    Some(route_id)
                }
                Err(source) => {
                    return Err(EventError::Transport {
                        operation: "create_route",
                        attempts: outcome.attempts,
                        source,
                    });
                }
            }
        } else {
            None
        };

        let entry = subscriptions.entry(event_type).or_default();
        if new_route.is_some() {
            entry.route_id = new_route;
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        entry.subscribers.push(Subscriber::spawn(
            id,
            event_type,
            handler,
            self.config.subscriber_queue_capacity,
        ));
        debug!(
            "Subscription {} added for {} ({} total)",
            id,
            event_type,
            entry.subscribers.len()
        );
        Ok(id)
    }

    /// Remove a local handler
    ///
    /// The handler's queue is drained in the background. Removing the last
    /// handler for a type deletes the transport route; a failed deletion is
    /// logged and does not restore the subscription.
    pub async fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> Result<()> {
        self.ensure_registered(event_type)?;

        let mut subscriptions = self.subscriptions.write().await;
        let unknown = || EventError::UnknownSubscription {
            event_type: event_type.to_string(),
            id,
        };

        let entry = subscriptions.get_mut(&event_type).ok_or_else(unknown)?;
        let position = entry
            .subscribers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(unknown)?;
        entry.subscribers.remove(position);
        debug!("Subscription {} removed for {}", id, event_type);

        if !entry.subscribers.is_empty() {
            return Ok(());
        }

        let route_id = entry.route_id.take();
        subscriptions.remove(&event_type);
        if let Some(route_id) = route_id {
            self.delete_route(&route_id).await;
        }
        Ok(())
    }

    /// Number of local handlers for `event_type`
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscriptions
            .read()
            .await
            .get(&event_type)
            .map_or(0, |s| s.subscribers.len())
    }

    /// Hand an externally routed event to the local subscribers
    pub async fn deliver(&self, event: Event) -> Result<()> {
        self.ensure_registered(event.event_type)?;
        self.dispatch(std::slice::from_ref(&event)).await;
        Ok(())
    }

    /// Number of events waiting in batch queues
    pub async fn pending_events(&self) -> usize {
        self.queues.lock().await.values().map(VecDeque::len).sum()
    }

    /// Flush every queue that is full or older than the max age
    ///
    /// Returns the number of events the transport accepted.
    pub async fn flush_due(&self) -> usize {
        let due = {
            let mut queues = self.queues.lock().await;
            let mut due = Vec::new();
            for (event_type, queue) in queues.iter_mut() {
                let expired = queue
                    .front()
                    .is_some_and(|q| q.enqueued_at.elapsed() >= self.config.batch_max_age);
                if queue.len() >= self.config.batch_size || expired {
                    due.push((*event_type, std::mem::take(queue)));
                }
            }
            queues.retain(|_, q| !q.is_empty());
            due
        };

        self.flush_batches(due).await
    }

    /// Flush every non-empty queue regardless of size or age
    pub async fn flush_all(&self) -> usize {
        let all: Vec<_> = self.queues.lock().await.drain().collect();
        self.flush_batches(all).await
    }

    /// Stop the flush loop, flush remaining queues and drain subscribers
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.flush_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Event bus flush loop ended abnormally: {}", e);
            }
        }

        let flushed = self.flush_all().await;
        if flushed > 0 {
            info!("Flushed {} queued event(s) on shutdown", flushed);
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.write().await);
        let mut tasks = Vec::new();
        for (_, entry) in subscriptions {
            if let Some(route_id) = entry.route_id {
                self.delete_route(&route_id).await;
            }
            for subscriber in entry.subscribers {
                drop(subscriber.sender);
                tasks.push(subscriber.task);
            }
        }
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Subscriber dispatch task ended abnormally: {}", e);
            }
        }
        info!("Event bus shut down");
    }

    fn ensure_registered(&self, event_type: EventType) -> Result<()> {
        if self.config.event_types.contains(&event_type) {
            Ok(())
        } else {
            Err(EventError::InvalidEventType(event_type.to_string()))
        }
    }

    fn rule_name(&self, event_type: EventType) -> String {
        format!(
            "{}-{}",
            self.config.rule_prefix,
            event_type.as_str().to_ascii_lowercase()
        )
    }

    async fn send_now(&self, event: Event) -> Result<String> {
        let detail = event.to_detail()?;
        let name = event.event_type.as_str();

        let outcome = self
            .config
            .retry
            .execute(name, || self.transport.send(name, detail.clone()))
            .await;

        match outcome.result {
            Ok(ack_id) => {
                debug!("Published {} as {}", name, ack_id);
                if self.config.local_dispatch {
                    self.dispatch(std::slice::from_ref(&event)).await;
                }
                Ok(ack_id)
            }
            Err(source) => Err(EventError::Transport {
                operation: "send",
                attempts: outcome.attempts,
                source,
            }),
        }
    }

    async fn enqueue(&self, event: Event) -> Result<PublishReceipt> {
        let event_type = event.event_type;
        let ready = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(event_type).or_default();
            queue.push_back(QueuedEvent {
                event,
                enqueued_at: Instant::now(),
                requeued: false,
            });
            let expired = queue
                .front()
                .is_some_and(|q| q.enqueued_at.elapsed() >= self.config.batch_max_age);
            if queue.len() < self.config.batch_size && !expired {
                return Ok(PublishReceipt::Queued {
                    pending: queue.len(),
                });
            }
            queues.remove(&event_type).unwrap_or_default()
        };

        match self.flush_batch(event_type, ready).await {
            FlushOutcome::Sent(acks) => Ok(PublishReceipt::Flushed(acks)),
            FlushOutcome::Requeued { pending } => Ok(PublishReceipt::Queued { pending }),
            FlushOutcome::Dropped => Ok(PublishReceipt::Queued { pending: 0 }),
        }
    }

    async fn flush_batches(&self, batches: Vec<(EventType, VecDeque<QueuedEvent>)>) -> usize {
        let mut sent = 0;
        for (event_type, batch) in batches {
            if batch.is_empty() {
                continue;
            }
            if let FlushOutcome::Sent(acks) = self.flush_batch(event_type, batch).await {
                sent += acks.len();
            }
        }
        sent
    }

    async fn flush_batch(
        &self,
        event_type: EventType,
        batch: VecDeque<QueuedEvent>,
    ) -> FlushOutcome {
        let details: Result<Vec<_>> = batch.iter().map(|q| q.event.to_detail()).collect();
        let details = match details {
            Ok(details) => details,
            Err(e) => {
                error!(
                    "Dropping {} {} event(s): serialization failed: {}",
                    batch.len(),
                    event_type,
                    e
                );
                return FlushOutcome::Dropped;
            }
        };

        match self
            .transport
            .send_batch(event_type.as_str(), details)
            .await
        {
            Ok(acks) => {
                debug!("Flushed batch of {} {}", acks.len(), event_type);
                if self.config.local_dispatch {
                    let events: Vec<Event> = batch.into_iter().map(|q| q.event).collect();
                    self.dispatch(&events).await;
                }
                FlushOutcome::Sent(acks)
            }
            Err(e) => {
                let (dropped, retry): (Vec<_>, Vec<_>) =
                    batch.into_iter().partition(|q| q.requeued);

                let pending = if retry.is_empty() {
                    0
                } else {
                    warn!(
                        "Batch flush of {} {} event(s) failed, requeueing: {}",
                        retry.len(),
                        event_type,
                        e
                    );
                    let mut queues = self.queues.lock().await;
                    let queue = queues.entry(event_type).or_default();
                    for mut item in retry.into_iter().rev() {
                        item.requeued = true;
                        queue.push_front(item);
                    }
                    queue.len()
                };

                if dropped.is_empty() {
                    FlushOutcome::Requeued { pending }
                } else {
                    self.report_dropped(event_type, dropped.len(), &e.to_string())
                        .await;
                    if pending > 0 {
                        FlushOutcome::Requeued { pending }
                    } else {
                        FlushOutcome::Dropped
                    }
                }
            }
        }
    }

    async fn report_dropped(&self, event_type: EventType, count: usize, reason: &str) {
        error!(
            "Dropped {} {} event(s) after retried flush failed: {}",
            count, event_type, reason
        );
        if event_type == EventType::EventsDropped {
            return;
        }

        let mut payload = Payload::new();
        payload.insert("event_type".to_string(), event_type.as_str().into());
        payload.insert("count".to_string(), count.into());
        payload.insert("error".to_string(), reason.into());

        if let Err(e) = self
            .send_now(Event::new(EventType::EventsDropped, payload))
            .await
        {
            error!("Failed to announce dropped events: {}", e);
        }
    }

    async fn delete_route(&self, route_id: &str) {
        let outcome = self
            .config
            .retry
            .execute("delete_route", || self.transport.delete_route(route_id))
            .await;
        match outcome.result {
            Ok(()) => info!("Deleted route {}", route_id),
            Err(e) => warn!("Failed to delete route {}: {}", route_id, e),
        }
    }

    async fn dispatch(&self, events: &[Event]) {
        let Some(first) = events.first() else { return };
        let senders: Vec<mpsc::Sender<Event>> = {
            let subscriptions = self.subscriptions.read().await;
            match subscriptions.get(&first.event_type) {
                Some(entry) => entry.subscribers.iter().map(|s| s.sender.clone()).collect(),
                None => return,
            }
        };

        for event in events {
            let results = join_all(senders.iter().map(|s| s.send(event.clone()))).await;
            let closed = results.iter().filter(|r| r.is_err()).count();
            if closed > 0 {
                debug!(
                    "{} subscriber queue(s) closed before {} could be delivered",
                    closed, event.correlation_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::handler::FnHandler;
    use crate::transport::{InMemoryTransport, MockEventTransport};
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    fn config(batch_size: usize) -> EventBusConfig {
        EventBusConfig {
            batch_size,
            batch_max_age: Duration::from_secs(60),
            flush_interval: Duration::from_millis(10),
            retry: RetryPolicy::fast(),
            ..EventBusConfig::default()
        }
    }

    fn payload(n: i64) -> Payload {
        let mut payload = Payload::new();
        payload.insert("n".to_string(), json!(n));
        payload
    }

    fn recording_handler() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = FnHandler::new("recorder", move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok::<_, anyhow::Error>(())
            }
        });
        (Arc::new(handler), rx)
    }

    #[tokio::test]
    async fn test_publish_immediate() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = EventBus::new(transport.clone(), config(5));

        let receipt = bus
            .publish(EventType::HealthCheck, payload(1), false)
            .await
            .unwrap();

        assert!(matches!(receipt, PublishReceipt::Sent(ack) if ack.starts_with("ack-")));
        assert_eq!(transport.send_calls(), 1);
        let sent = transport.sent().await;
        assert_eq!(sent[0].detail["payload"]["n"], json!(1));
    }

    #[tokio::test]
    async fn test_invalid_event_type() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut cfg = config(5);
        cfg.event_types = HashSet::from([EventType::StageFailed]);
        let bus = EventBus::new(transport.clone(), cfg);

        let err = bus
            .publish_named("NOT_A_TYPE", Payload::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidEventType(_)));

        let err = bus
            .publish(EventType::HealthCheck, Payload::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidEventType(name) if name == "HEALTH_CHECK"));

        let (handler, _rx) = recording_handler();
        assert!(bus.subscribe(EventType::HealthCheck, handler).await.is_err());
        assert_eq!(transport.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_waits_for_size_threshold() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = EventBus::new(transport.clone(), config(5));

        for n in 0..3 {
            let receipt = bus
                .publish(EventType::StageStarted, payload(n), true)
                .await
                .unwrap();
            assert_eq!(
                receipt,
                PublishReceipt::Queued {
                    pending: (n + 1) as usize
                }
            );
        }
        assert_eq!(transport.send_calls() + transport.batch_calls(), 0);
        assert_eq!(bus.pending_events().await, 3);

        bus.publish(EventType::StageStarted, payload(3), true)
            .await
            .unwrap();
        assert_eq!(transport.batch_calls(), 0);

        let receipt = bus
            .publish(EventType::StageStarted, payload(4), true)
            .await
            .unwrap();
        assert!(matches!(receipt, PublishReceipt::Flushed(acks) if acks.len() == 5));
        assert_eq!(transport.batch_calls(), 1);
        assert_eq!(transport.send_calls(), 0);
        assert_eq!(bus.pending_events().await, 0);
    }

    #[tokio::test]
    async fn test_queues_are_per_type() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = EventBus::new(transport.clone(), config(2));

        bus.publish(EventType::StageStarted, payload(1), true)
            .await
            .unwrap();
        bus.publish(EventType::WorkflowCreated, payload(2), true)
            .await
            .unwrap();

        assert_eq!(transport.batch_calls(), 0);
        assert_eq!(bus.pending_events().await, 2);
    }

    #[tokio::test]
    async fn test_flush_loop_flushes_by_age() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut cfg = config(5);
        cfg.batch_max_age = Duration::from_millis(50);
        let bus = Arc::new(EventBus::new(transport.clone(), cfg));
        bus.start().await;

        bus.publish(EventType::HealthCheck, payload(1), true)
            .await
            .unwrap();
        assert_eq!(transport.batch_calls(), 0);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.batch_calls(), 1);
        assert_eq!(bus.pending_events().await, 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_flushes_stale_queue_without_loop() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut cfg = config(5);
        cfg.batch_max_age = Duration::from_millis(50);
        let bus = EventBus::new(transport.clone(), cfg);

        bus.publish(EventType::HealthCheck, payload(1), true)
            .await
            .unwrap();
        sleep(Duration::from_millis(80)).await;
        assert_eq!(transport.batch_calls(), 0);

        let receipt = bus
            .publish(EventType::HealthCheck, payload(2), true)
            .await
            .unwrap();
        assert!(matches!(receipt, PublishReceipt::Flushed(ref acks) if acks.len() == 2));
        assert_eq!(transport.batch_calls(), 1);
        assert_eq!(bus.pending_events().await, 0);
    }

    #[tokio::test]
    async fn test_transport_retry_exhausted() {
        let mut transport = MockEventTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| Err(TransportError::new("throttled")));
        let bus = EventBus::new(Arc::new(transport), config(5));

        let err = bus
            .publish(EventType::WorkflowFailed, Payload::new(), false)
            .await
            .unwrap_err();

        match err {
            EventError::Transport {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "send");
                assert_eq!(attempts, 3);
                assert_eq!(source.message, "throttled");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_transport_error_not_retried() {
        let mut transport = MockEventTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _| Err(TransportError::permanent("forbidden")));
        let bus = EventBus::new(Arc::new(transport), config(5));

        let err = bus
            .publish(EventType::WorkflowFailed, Payload::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Transport { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_failed_flush_requeued_once_then_dropped() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = EventBus::new(transport.clone(), config(2));
        transport.fail_next(2).await;

        bus.publish(EventType::StageStarted, payload(1), true)
            .await
            .unwrap();
        let receipt = bus
            .publish(EventType::StageStarted, payload(2), true)
            .await
            .unwrap();

        assert_eq!(receipt, PublishReceipt::Queued { pending: 2 });
        assert_eq!(transport.batch_calls(), 1);

        let sent = bus.flush_all().await;
        assert_eq!(sent, 0);
        assert_eq!(transport.batch_calls(), 2);
        assert_eq!(bus.pending_events().await, 0);

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "EVENTS_DROPPED");
        assert_eq!(sent[0].detail["payload"]["count"], json!(2));
        assert_eq!(sent[0].detail["payload"]["event_type"], json!("STAGE_STARTED"));
    }

    #[tokio::test]
    async fn test_requeued_batch_succeeds_on_retry() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = EventBus::new(transport.clone(), config(2));
        transport.fail_next(1).await;

        bus.publish(EventType::StageStarted, payload(1), true)
            .await
            .unwrap();
        bus.publish(EventType::StageStarted, payload(2), true)
            .await
            .unwrap();

        assert_eq!(bus.flush_due().await, 2);
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].detail["payload"]["n"], json!(1));
    }

    #[tokio::test]
    async fn test_subscribe_manages_routes() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = EventBus::new(transport.clone(), config(5));

        let (h1, _rx1) = recording_handler();
        let (h2, _rx2) = recording_handler();
        let first = bus.subscribe(EventType::StageFailed, h1).await.unwrap();
        let second = bus.subscribe(EventType::StageFailed, h2).await.unwrap();

        let routes = transport.routes().await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].rule_name, "agent-orchestrator-stage_failed");
        assert_eq!(routes[0].target, "agent-orchestrator");
        assert_eq!(bus.subscriber_count(EventType::StageFailed).await, 2);

        bus.unsubscribe(EventType::StageFailed, first).await.unwrap();
        assert_eq!(transport.routes().await.len(), 1);

        bus.unsubscribe(EventType::StageFailed, second).await.unwrap();
        assert!(transport.routes().await.is_empty());
        assert_eq!(bus.subscriber_count(EventType::StageFailed).await, 0);

        let err = bus
            .unsubscribe(EventType::StageFailed, second)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::UnknownSubscription { .. }));
    }

    #[tokio::test]
    async fn test_local_dispatch_after_send() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = EventBus::new(transport.clone(), config(2));
        let (handler, mut rx) = recording_handler();
        bus.subscribe(EventType::StageCompleted, handler)
            .await
            .unwrap();

        bus.publish(EventType::StageCompleted, payload(7), false)
            .await
            .unwrap();
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::StageCompleted);
        assert_eq!(event.payload["n"], json!(7));

        bus.publish(EventType::StageCompleted, payload(8), true)
            .await
            .unwrap();
        bus.publish(EventType::StageCompleted, payload(9), true)
            .await
            .unwrap();
        for expected in [8, 9] {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.payload["n"], json!(expected));
        }
    }

    #[tokio::test]
    async fn test_deliver_without_local_dispatch() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut cfg = config(5);
        cfg.local_dispatch = false;
        let bus = EventBus::new(transport.clone(), cfg);
        let (handler, mut rx) = recording_handler();
        bus.subscribe(EventType::AgentRegistered, handler)
            .await
            .unwrap();

        bus.publish(EventType::AgentRegistered, payload(1), false)
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );

        let routed = Event::from_detail(transport.sent().await[0].detail.clone()).unwrap();
        bus.deliver(routed.clone()).await.unwrap();
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, routed);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_drains() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = Arc::new(EventBus::new(transport.clone(), config(10)));
        bus.start().await;
        let (handler, mut rx) = recording_handler();
        bus.subscribe(EventType::HealthCheck, handler).await.unwrap();

        bus.publish(EventType::HealthCheck, payload(1), true)
            .await
            .unwrap();
        bus.shutdown().await;

        assert_eq!(transport.batch_calls(), 1);
        assert_eq!(bus.pending_events().await, 0);
        assert!(transport.routes().await.is_empty());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
