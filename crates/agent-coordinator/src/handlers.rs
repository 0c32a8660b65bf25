//! Event handlers the coordinator subscribes at start-up
//!
//! Both handlers may see the same event more than once and must leave the
//! same state behind either way.

use agent_events::{Event, EventHandler, EventType};
use agent_workflow::{StageState, WorkflowManager};
use anyhow::{Context, bail};
use async_trait::async_trait;
use cached::{Cached, SizedCache};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

// Run ids remembered for de-duplicating workflow outcome events.
const SEEN_RUNS: usize = 4096;

/// Re-applies stage outcomes announced on the bus to the stored workflow
pub struct StageEventHandler {
    manager: Arc<WorkflowManager>,
}

impl StageEventHandler {
    pub fn new(manager: Arc<WorkflowManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for StageEventHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let state = match event.event_type {
            EventType::StageCompleted => StageState::Completed,
            EventType::StageFailed => StageState::Failed,
            other => bail!("stage handler received {other}"),
        };
        let workflow_id = event
            .payload_str("workflow_id")
            .context("stage event without workflow_id")?;
        let stage_id = event
            .payload_str("stage_id")
            .context("stage event without stage_id")?;
        let error_context = event
            .payload
            .get("error_context")
            .and_then(|v| v.as_object())
            .cloned();

        let changed = self
            .manager
            .apply_stage_update(workflow_id, stage_id, state, error_context)
            .await?;
        if !changed {
            debug!(
                "Stage '{}' of workflow '{}' already {}",
                stage_id, workflow_id, state
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stage-state"
    }
}

/// Workflow outcome totals
#[derive(Debug, Default)]
pub struct WorkflowCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

impl WorkflowCounters {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Counts workflow completions and failures, once per run
pub struct WorkflowEventHandler {
    counters: Arc<WorkflowCounters>,
    seen: Mutex<SizedCache<(EventType, String), ()>>,
}

impl WorkflowEventHandler {
    pub fn new(counters: Arc<WorkflowCounters>) -> Self {
        Self {
            counters,
            seen: Mutex::new(SizedCache::with_size(SEEN_RUNS)),
        }
    }
}

#[async_trait]
impl EventHandler for WorkflowEventHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let counter = match event.event_type {
            EventType::WorkflowCompleted => &self.counters.completed,
            EventType::WorkflowFailed => &self.counters.failed,
            other => bail!("workflow handler received {other}"),
        };

        let key = (event.event_type, event.correlation_id.clone());
        {
            let mut seen = self.seen.lock().await;
            if seen.cache_get(&key).is_some() {
                debug!("Duplicate {} for run {}", event.event_type, event.correlation_id);
                return Ok(());
            }
            seen.cache_set(key, ());
        }

        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "workflow-counters"
    }
}
