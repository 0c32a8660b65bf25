//! Event transport contract and an in-memory implementation
//!
//! Any durable pub/sub service can back the bus as long as it can send single
//! events, send batches and manage routing rules.

use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

type TransportResult<T> = std::result::Result<T, TransportError>;

/// External pub/sub service the bus publishes through
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Send one event, returning the transport's acknowledgement id
    async fn send(&self, event_type: &str, detail: serde_json::Value) -> TransportResult<String>;

    /// Send several events of one type in a single call
    async fn send_batch(
        &self,
        event_type: &str,
        details: Vec<serde_json::Value>,
    ) -> TransportResult<Vec<String>>;

    /// Create a rule routing `event_type` to `target`, returning its id
    async fn create_route(
        &self,
        rule_name: &str,
        event_type: &str,
        target: &str,
    ) -> TransportResult<String>;

    /// Remove a previously created route
    async fn delete_route(&self, route_id: &str) -> TransportResult<()>;
}

/// A routing rule held by [`InMemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub route_id: String,
    pub rule_name: String,
    pub event_type: String,
    pub target: String,
}

/// One event as received by [`InMemoryTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentEvent {
    pub ack_id: String,
    pub event_type: String,
    pub detail: serde_json::Value,
}

/// Transport that keeps everything in memory
///
/// Records every event it accepts, counts calls and can be told to fail the
/// next N calls, which makes it the reference transport for tests and the
/// CLI.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    sent: Mutex<Vec<SentEvent>>,
    routes: Mutex<HashMap<String, Route>>,
    scripted_failures: Mutex<VecDeque<TransportError>>,
    send_calls: AtomicU64,
    batch_calls: AtomicU64,
    next_id: AtomicU64,
}

impl InMemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` send/send_batch calls with a retryable error
    pub async fn fail_next(&self, count: usize) {
        let mut failures = self.scripted_failures.lock().await;
        for _ in 0..count {
            failures.push_back(TransportError::new("scripted transport failure"));
        }
    }

    /// Number of `send` calls, successful or not
    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Number of `send_batch` calls, successful or not
    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Every accepted event, in arrival order
    pub async fn sent(&self) -> Vec<SentEvent> {
        self.sent.lock().await.clone()
    }

    /// Wire names of every accepted event, in arrival order
    pub async fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    /// Active routes
    pub async fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.routes.lock().await.values().cloned().collect();
        routes.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        routes
    }

    fn next_id(&self, prefix: &str) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{id:06}")
    }

    async fn take_failure(&self) -> TransportResult<()> {
        match self.scripted_failures.lock().await.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventTransport for InMemoryTransport {
    async fn send(&self, event_type: &str, detail: serde_json::Value) -> TransportResult<String> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;

        let ack_id = self.next_id("ack");
        debug!("In-memory transport accepted {} as {}", event_type, ack_id);
        self.sent.lock().await.push(SentEvent {
            ack_id: ack_id.clone(),
            event_type: event_type.to_string(),
            detail,
        });
        Ok(ack_id)
    }

    async fn send_batch(
        &self,
        event_type: &str,
        details: Vec<serde_json::Value>,
    ) -> TransportResult<Vec<String>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;

        let mut sent = self.sent.lock().await;
        let mut acks = Vec::with_capacity(details.len());
        for detail in details {
            let ack_id = self.next_id("ack");
            sent.push(SentEvent {
                ack_id: ack_id.clone(),
                event_type: event_type.to_string(),
                detail,
            });
            acks.push(ack_id);
        }
        debug!(
            "In-memory transport accepted batch of {} {}",
            acks.len(),
            event_type
        );
        Ok(acks)
    }

    async fn create_route(
        &self,
        rule_name: &str,
        event_type: &str,
        target: &str,
    ) -> TransportResult<String> {
        let route_id = self.next_id("route");
        self.routes.lock().await.insert(
            route_id.clone(),
            Route {
                route_id: route_id.clone(),
                rule_name: rule_name.to_string(),
                event_type: event_type.to_string(),
                target: target.to_string(),
            },
        );
        Ok(route_id)
    }

    async fn delete_route(&self, route_id: &str) -> TransportResult<()> {
        match self.routes.lock().await.remove(route_id) {
            Some(_) => Ok(()),
            None => Err(TransportError::permanent(format!(
                "route not found: {route_id}"
            ))),
        }
    }
}
