//! Workflow manager
//!
//! Owns every workflow it creates, runs their stages one at a time through
//! the [`AgentExecution`] collaborator and announces each transition on the
//! event bus. One circuit breaker guards all stage executions of a manager.

use crate::dag::StageGraph;
use crate::error::{Result, WorkflowError};
use crate::stage::{Stage, StageDefinition, StageState};
use crate::workflow::{Workflow, WorkflowState};
use agent_core::{
    AgentExecution, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, Payload,
    RetryPolicy, SecurityContext, StageError,
};
use agent_events::{Event, EventBus, EventType};
use agent_utils::Config;
use cached::{Cached, TimedCache};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for the workflow manager
#[derive(Debug, Clone)]
pub struct WorkflowManagerConfig {
    /// How long an untouched workflow stays in memory
    pub cache_ttl: Duration,
    /// Retry policy for each stage's agent call
    pub stage_retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for WorkflowManagerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for WorkflowManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            cache_ttl: Duration::from_secs(config.workflow.cache_ttl_seconds),
            stage_retry: RetryPolicy::from(&config.workflow.stage_retry),
            circuit_breaker: CircuitBreakerConfig::from(&config.circuit_breaker),
        }
    }
}

// Workflows expire from `idle` once untouched for the TTL. A running
// workflow is held in `running` and only goes back to `idle` when its run
// ends, so it cannot expire mid-run.
struct WorkflowStore {
    idle: TimedCache<String, Workflow>,
    running: HashMap<String, Workflow>,
}

impl WorkflowStore {
    fn new(ttl: Duration) -> Self {
        Self {
            idle: TimedCache::with_lifespan(ttl),
            running: HashMap::new(),
        }
    }

    fn contains(&mut self, workflow_id: &str) -> bool {
        self.running.contains_key(workflow_id) || self.idle.cache_get(workflow_id).is_some()
    }

    fn get(&mut self, workflow_id: &str) -> Option<&Workflow> {
        match self.running.get(workflow_id) {
            Some(workflow) => Some(workflow),
            None => self.idle.cache_get(workflow_id),
        }
    }

    fn take(&mut self, workflow_id: &str) -> Option<Workflow> {
        self.running
            .remove(workflow_id)
            .or_else(|| self.idle.cache_remove(workflow_id))
    }

    fn put(&mut self, workflow: Workflow) {
        let workflow_id = workflow.workflow_id.clone();
        if workflow.state == WorkflowState::Running {
            self.running.insert(workflow_id, workflow);
        } else {
            self.idle.cache_set(workflow_id, workflow);
        }
    }

    fn len(&mut self) -> usize {
        self.idle.flush();
        self.idle.cache_size() + self.running.len()
    }
}

/// Creates, stores and executes workflows
///
/// # Example
///
/// ```no_run
/// use agent_workflow::{StageDefinition, WorkflowManager};
/// use agent_core::{Payload, SecurityContext};
/// use std::sync::Arc;
///
/// # async fn example(
/// #     executor: Arc<dyn agent_core::AgentExecution>,
/// #     bus: Arc<agent_events::EventBus>,
/// # ) -> agent_workflow::Result<()> {
/// let manager = WorkflowManager::builder()
///     .executor(executor)
///     .event_bus(bus)
///     .build()?;
///
/// let context = SecurityContext::new()
///     .with_user_id("user-1")
///     .with_permissions(["workflow:execute"]);
///
/// manager
///     .create_workflow(
///         "nightly-report",
///         vec![
///             StageDefinition::new("fetch", "crawler"),
///             StageDefinition::new("summarize", "writer").depends_on("fetch"),
///         ],
///         Payload::new(),
///         context,
///     )
///     .await?;
///
/// let finished = manager.execute_workflow("nightly-report").await?;
/// println!("{}", finished.state);
/// # Ok(())
/// # }
/// ```
pub struct WorkflowManager {
    executor: Arc<dyn AgentExecution>,
    bus: Arc<EventBus>,
    config: WorkflowManagerConfig,
    workflows: Mutex<WorkflowStore>,
    breaker: Mutex<CircuitBreaker>,
}

impl WorkflowManager {
    /// Create a new workflow manager
    pub fn new(
        executor: Arc<dyn AgentExecution>,
        bus: Arc<EventBus>,
        config: WorkflowManagerConfig,
    ) -> Self {
        Self {
            executor,
            bus,
            workflows: Mutex::new(WorkflowStore::new(config.cache_ttl)),
            breaker: Mutex::new(CircuitBreaker::new("workflow", config.circuit_breaker.clone())),
            config,
        }
    }

    /// Create a new manager builder
    pub fn builder() -> WorkflowManagerBuilder {
        WorkflowManagerBuilder::new()
    }

    /// Get a reference to the event bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Get a reference to the manager configuration
    pub fn config(&self) -> &WorkflowManagerConfig {
        &self.config
    }

    /// Validate and store a new workflow
    ///
    /// Nothing is stored when validation fails.
    ///
    /// # Errors
    ///
    /// `DuplicateStage`, `UnknownDependency`, `CyclicDependency`,
    /// `InvalidSecurityContext` or `WorkflowExists`.
    pub async fn create_workflow(
        &self,
        workflow_id: impl Into<String>,
        stages: Vec<StageDefinition>,
        config: Payload,
        security_context: SecurityContext,
    ) -> Result<Workflow> {
        let workflow_id = workflow_id.into();
        let graph = StageGraph::build(&stages)?;
        security_context.validate()?;

        let workflow = Workflow::new(workflow_id.clone(), stages, &graph, config, security_context);
        {
            let mut workflows = self.workflows.lock().await;
            if workflows.contains(&workflow_id) {
                return Err(WorkflowError::WorkflowExists(workflow_id));
            }
            workflows.put(workflow.clone());
        }

        info!(
            "Created workflow '{}' with {} stage(s), order: {}",
            workflow_id,
            workflow.stages.len(),
            workflow.execution_order.join(" -> ")
        );
        self.announce(
            EventType::WorkflowCreated,
            None,
            json!({
                "workflow_id": workflow_id,
                "stage_count": workflow.stages.len(),
                "execution_order": workflow.execution_order,
            }),
            true,
        )
        .await;

        Ok(workflow)
    }

    /// Run a pending workflow to completion or first failure
    ///
    /// Stages run strictly one after another in the order fixed at creation.
    /// On a stage failure the remaining stages stay `PENDING` and completed
    /// stages keep their state.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` (before or between stages), `WorkflowNotFound`,
    /// `NotRunnable` or `StageFailed`.
    pub async fn execute_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.breaker.lock().await.check()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let workflow = self
            .update(workflow_id, |workflow| {
                if workflow.state != WorkflowState::Pending {
                    return Err(WorkflowError::NotRunnable {
                        workflow_id: workflow.workflow_id.clone(),
                        state: workflow.state,
                    });
                }
                workflow.state = WorkflowState::Running;
                workflow.run_id = Some(run_id.clone());
                workflow.metrics.start();
                Ok(())
            })
            .await?;

        info!("Workflow '{}' started (run {})", workflow_id, run_id);
        self.announce(
            EventType::WorkflowStarted,
            Some(&run_id),
            json!({"workflow_id": workflow_id, "stage_count": workflow.stages.len()}),
            true,
        )
        .await;

        for &index in workflow.order() {
            let gate = self.breaker.lock().await.try_acquire();
            if let Err(e) = gate {
                return Err(self.abort_on_open_circuit(workflow_id, &run_id, e).await);
            }

            let stage = self.start_stage(workflow_id, &run_id, index).await?;
            let label = format!("{workflow_id}/{}", stage.stage_id);
            let outcome = self
                .config
                .stage_retry
                .execute(&label, || {
                    self.executor.execute(
                        &stage.agent_id,
                        &stage.stage_config,
                        &workflow.security_context,
                    )
                })
                .await;

            match outcome.result {
                Ok(output) => {
                    self.breaker.lock().await.record_success();
                    self.complete_stage(workflow_id, &run_id, index, output, outcome.attempts)
                        .await?;
                }
                Err(error) => {
                    self.breaker.lock().await.record_failure();
                    return Err(self
                        .fail_stage(workflow_id, &run_id, index, error, outcome.attempts)
                        .await);
                }
            }
        }

        let finished = self
            .update(workflow_id, |workflow| {
                workflow.state = WorkflowState::Completed;
                workflow.metrics.finish();
                Ok(())
            })
            .await?;

        info!(
            "Workflow '{}' completed in {}ms",
            workflow_id,
            finished.metrics.duration_ms.unwrap_or_default()
        );
        self.announce(
            EventType::WorkflowCompleted,
            Some(&run_id),
            json!({
                "workflow_id": workflow_id,
                "duration_ms": finished.metrics.duration_ms,
                "completed_stage_count": finished.metrics.completed_stage_count,
            }),
            false,
        )
        .await;

        Ok(finished)
    }

    /// Re-apply a terminal stage state delivered by an event
    ///
    /// Last write wins between `COMPLETED` and `FAILED`. Re-applying the
    /// current state (and error context) changes nothing. Unknown workflows
    /// are ignored since they may have expired. Returns whether the stage
    /// changed.
    pub async fn apply_stage_update(
        &self,
        workflow_id: &str,
        stage_id: &str,
        state: StageState,
        error_context: Option<Payload>,
    ) -> Result<bool> {
        if !state.is_terminal() {
            debug!(
                "Ignoring non-terminal update {} for stage '{}'",
                state, stage_id
            );
            return Ok(false);
        }

        let mut workflows = self.workflows.lock().await;
        let Some(mut workflow) = workflows.take(workflow_id) else {
            debug!(
                "Ignoring stage update for unknown workflow '{}'",
                workflow_id
            );
            return Ok(false);
        };

        let changed = match workflow.stage_mut(stage_id) {
            None => Err(WorkflowError::UnknownStage {
                workflow_id: workflow_id.to_string(),
                stage_id: stage_id.to_string(),
            }),
            Some(stage) => {
                let context = match state {
                    StageState::Failed => error_context.or_else(|| stage.error_context.clone()),
                    _ => None,
                };
                if stage.state == state && stage.error_context == context {
                    Ok(false)
                } else {
                    stage.state = state;
                    stage.error_context = context;
                    stage.finished_at.get_or_insert_with(Utc::now);
                    Ok(true)
                }
            }
        };

        workflows.put(workflow);
        if let Ok(true) = changed {
            info!(
                "Stage '{}' of workflow '{}' set to {} by event",
                stage_id, workflow_id, state
            );
        }
        changed
    }

    /// Snapshot of a stored workflow
    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.lock().await.get(workflow_id).cloned()
    }

    /// Drop a workflow from the store
    pub async fn remove_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.lock().await.take(workflow_id)
    }

    /// Number of live (unexpired or running) workflows
    pub async fn workflow_count(&self) -> usize {
        self.workflows.lock().await.len()
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().await.state()
    }

    pub async fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.breaker.lock().await.snapshot()
    }

    // Apply `f` to a stored workflow and write it back, refreshing its TTL.
    // `f` must not mutate the workflow when it returns an error.
    async fn update<F>(&self, workflow_id: &str, f: F) -> Result<Workflow>
    where
        F: FnOnce(&mut Workflow) -> Result<()>,
    {
        let mut workflows = self.workflows.lock().await;
        let mut workflow = workflows
            .take(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        let result = f(&mut workflow);
        workflows.put(workflow.clone());
        result.map(|()| workflow)
    }

    async fn start_stage(&self, workflow_id: &str, run_id: &str, index: usize) -> Result<Stage> {
        let workflow = self
            .update(workflow_id, |workflow| {
                workflow.stage_at_mut(index).mark_running();
                Ok(())
            })
            .await?;
        let stage = workflow.stages[index].clone();

        debug!(
            "Stage '{}' of workflow '{}' running on agent '{}'",
            stage.stage_id, workflow_id, stage.agent_id
        );
        self.announce(
            EventType::StageStarted,
            Some(run_id),
            json!({
                "workflow_id": workflow_id,
                "stage_id": stage.stage_id,
                "agent_id": stage.agent_id,
            }),
            true,
        )
        .await;
        Ok(stage)
    }

    async fn complete_stage(
        &self,
        workflow_id: &str,
        run_id: &str,
        index: usize,
        output: Value,
        attempts: u32,
    ) -> Result<()> {
        let workflow = self
            .update(workflow_id, |workflow| {
                workflow.stage_at_mut(index).mark_completed(output, attempts);
                workflow.metrics.completed_stage_count += 1;
                Ok(())
            })
            .await?;
        let stage = &workflow.stages[index];

        info!(
            "Stage '{}' of workflow '{}' completed after {} attempt(s)",
            stage.stage_id, workflow_id, attempts
        );
        self.announce(
            EventType::StageCompleted,
            Some(run_id),
            json!({
                "workflow_id": workflow_id,
                "stage_id": stage.stage_id,
                "agent_id": stage.agent_id,
                "attempts": attempts,
                "output": stage.output,
            }),
            false,
        )
        .await;
        Ok(())
    }

    async fn fail_stage(
        &self,
        workflow_id: &str,
        run_id: &str,
        index: usize,
        error: StageError,
        attempts: u32,
    ) -> WorkflowError {
        let mut error_context = Payload::new();
        error_context.insert("error".to_string(), json!(error.message));
        error_context.insert("agent_id".to_string(), json!(error.agent_id));
        error_context.insert("attempts".to_string(), json!(attempts));
        error_context.insert("retryable".to_string(), json!(error.retryable));
        error_context.insert(
            "details".to_string(),
            error.details.clone().unwrap_or(Value::Null),
        );
        error_context.insert("failed_at".to_string(), json!(Utc::now().to_rfc3339()));

        let updated = self
            .update(workflow_id, |workflow| {
                workflow
                    .stage_at_mut(index)
                    .mark_failed(error_context.clone(), attempts);
                workflow.metrics.failed_stage_count += 1;
                workflow.state = WorkflowState::Failed;
                workflow.metrics.finish();
                Ok(())
            })
            .await;
        let workflow = match updated {
            Ok(workflow) => workflow,
            Err(e) => return e,
        };
        let stage_id = workflow.stages[index].stage_id.clone();

        warn!(
            "Stage '{}' of workflow '{}' failed after {} attempt(s): {}",
            stage_id, workflow_id, attempts, error
        );
        self.announce(
            EventType::StageFailed,
            Some(run_id),
            json!({
                "workflow_id": workflow_id,
                "stage_id": stage_id,
                "agent_id": error.agent_id,
                "error_context": error_context,
            }),
            false,
        )
        .await;
        self.announce(
            EventType::WorkflowFailed,
            Some(run_id),
            json!({
                "workflow_id": workflow_id,
                "reason": "stage_failed",
                "failed_stage": stage_id,
                "error": error.message,
            }),
            false,
        )
        .await;

        WorkflowError::StageFailed {
            workflow_id: workflow_id.to_string(),
            stage_id,
            source: error,
        }
    }

    async fn abort_on_open_circuit(
        &self,
        workflow_id: &str,
        run_id: &str,
        error: agent_core::Error,
    ) -> WorkflowError {
        let updated = self
            .update(workflow_id, |workflow| {
                workflow.state = WorkflowState::Failed;
                workflow.metrics.finish();
                Ok(())
            })
            .await;
        if let Err(e) = updated {
            return e;
        }

        warn!(
            "Workflow '{}' aborted between stages: {}",
            workflow_id, error
        );
        self.announce(
            EventType::WorkflowFailed,
            Some(run_id),
            json!({
                "workflow_id": workflow_id,
                "reason": "circuit_open",
                "error": error.to_string(),
            }),
            false,
        )
        .await;
        WorkflowError::from(error)
    }

    async fn announce(&self, event_type: EventType, run_id: Option<&str>, payload: Value, batch: bool) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        let event = match run_id {
            Some(run_id) => Event::with_correlation(event_type, payload, run_id),
            None => Event::new(event_type, payload),
        };
        if let Err(e) = self.bus.publish_event(event, batch).await {
            warn!("Failed to publish {}: {}", event_type, e);
        }
    }
}

/// Builder for WorkflowManager
pub struct WorkflowManagerBuilder {
    executor: Option<Arc<dyn AgentExecution>>,
    bus: Option<Arc<EventBus>>,
    config: WorkflowManagerConfig,
}

impl WorkflowManagerBuilder {
    /// Create a new manager builder
    pub fn new() -> Self {
        Self {
            executor: None,
            bus: None,
            config: WorkflowManagerConfig::default(),
        }
    }

    /// Set the agent execution collaborator
    pub fn executor(mut self, executor: Arc<dyn AgentExecution>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the event bus
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the manager configuration
    pub fn config(mut self, config: WorkflowManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-stage retry policy
    pub fn stage_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.stage_retry = policy;
        self
    }

    /// Set the circuit breaker thresholds
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Build the manager
    ///
    /// # Errors
    ///
    /// Returns an error if the executor or the event bus is not set
    pub fn build(self) -> Result<WorkflowManager> {
        let executor = self.executor.ok_or_else(|| {
            WorkflowError::InitializationFailed("Agent executor not set".to_string())
        })?;
        let bus = self
            .bus
            .ok_or_else(|| WorkflowError::InitializationFailed("Event bus not set".to_string()))?;

        Ok(WorkflowManager::new(executor, bus, self.config))
    }
}

impl Default for WorkflowManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_events::{EventBusConfig, InMemoryTransport};
    use async_trait::async_trait;
    use mockall::mock;
    use tokio::time::sleep;

    mock! {
        Executor {}

        #[async_trait]
        impl AgentExecution for Executor {
            async fn execute(
                &self,
                agent_id: &str,
                stage_config: &Payload,
                security_context: &SecurityContext,
            ) -> std::result::Result<Value, StageError>;
        }
    }

    struct Harness {
        manager: WorkflowManager,
        transport: Arc<InMemoryTransport>,
    }

    fn harness(executor: MockExecutor, threshold: u32, recovery: Duration) -> Harness {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = Arc::new(EventBus::new(
            transport.clone(),
            EventBusConfig {
                retry: RetryPolicy::fast(),
                ..EventBusConfig::default()
            },
        ));
        let manager = WorkflowManager::builder()
            .executor(Arc::new(executor))
            .event_bus(bus)
            .stage_retry(RetryPolicy::fast())
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            })
            .build()
            .unwrap();
        Harness { manager, transport }
    }

    fn context() -> SecurityContext {
        SecurityContext::new()
            .with_user_id("user-1")
            .with_permissions(["workflow:execute"])
    }

    fn fan_out() -> Vec<StageDefinition> {
        vec![
            StageDefinition::new("A", "agent-a"),
            StageDefinition::new("B", "agent-b").depends_on("A"),
            StageDefinition::new("C", "agent-c").depends_on("A"),
        ]
    }

    fn succeed_all() -> MockExecutor {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .returning(|agent_id, _, _| Ok(json!({"agent": agent_id})));
        executor
    }

    fn position(types: &[String], name: &str) -> usize {
        types
            .iter()
            .position(|t| t == name)
            .unwrap_or_else(|| panic!("{name} not published"))
    }

    #[tokio::test]
    async fn test_fan_out_workflow_completes() {
        let h = harness(succeed_all(), 5, Duration::from_secs(60));
        h.manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap();

        let workflow = h.manager.execute_workflow("wf").await.unwrap();

        assert_eq!(workflow.state, WorkflowState::Completed);
        assert_eq!(workflow.execution_order[0], "A");
        assert!(workflow.stages.iter().all(|s| s.state == StageState::Completed));
        assert_eq!(workflow.stage("B").unwrap().output, Some(json!({"agent": "agent-b"})));
        assert_eq!(workflow.metrics.completed_stage_count, 3);
        assert!(workflow.metrics.duration_ms.is_some());

        let types = h.transport.sent_types().await;
        let completed = types.iter().filter(|t| *t == "WORKFLOW_COMPLETED").count();
        assert_eq!(completed, 1);
        assert_eq!(types.iter().filter(|t| *t == "STAGE_COMPLETED").count(), 3);
    }

    #[tokio::test]
    async fn test_stage_failure_aborts_remaining() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .withf(|agent_id, _, _| agent_id == "agent-a")
            .times(1)
            .returning(|_, _, _| Ok(json!("ok")));
        executor
            .expect_execute()
            .withf(|agent_id, _, _| agent_id == "agent-b")
            .times(3)
            .returning(|agent_id, _, _| {
                Err(StageError::new(agent_id, "model timeout").with_details(json!({"code": 504})))
            });
        executor
            .expect_execute()
            .withf(|agent_id, _, _| agent_id == "agent-c")
            .never();
        let h = harness(executor, 5, Duration::from_secs(60));
        h.manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap();

        let err = h.manager.execute_workflow("wf").await.unwrap_err();
        assert!(matches!(
            &err,
            WorkflowError::StageFailed { stage_id, .. } if stage_id == "B"
        ));

        let workflow = h.manager.get_workflow("wf").await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Failed);
        assert_eq!(workflow.stage("A").unwrap().state, StageState::Completed);
        assert_eq!(workflow.stage("C").unwrap().state, StageState::Pending);

        let b = workflow.stage("B").unwrap();
        assert_eq!(b.state, StageState::Failed);
        assert_eq!(b.attempts, 3);
        let error_context = b.error_context.as_ref().unwrap();
        assert_eq!(error_context["error"], json!("model timeout"));
        assert_eq!(error_context["agent_id"], json!("agent-b"));
        assert_eq!(error_context["details"]["code"], json!(504));
        assert_eq!(workflow.metrics.failed_stage_count, 1);

        let types = h.transport.sent_types().await;
        assert!(position(&types, "STAGE_FAILED") < position(&types, "WORKFLOW_FAILED"));
        assert!(!types.iter().any(|t| t == "WORKFLOW_COMPLETED"));
    }

    #[tokio::test]
    async fn test_events_share_run_correlation() {
        let h = harness(succeed_all(), 5, Duration::from_secs(60));
        h.manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap();
        let workflow = h.manager.execute_workflow("wf").await.unwrap();
        h.manager.bus().flush_all().await;

        let run_id = workflow.run_id.unwrap();
        for sent in h.transport.sent().await {
            if sent.event_type == "WORKFLOW_CREATED" {
                continue;
            }
            assert_eq!(sent.detail["correlation_id"], json!(run_id));
        }
    }

    #[tokio::test]
    async fn test_invalid_definitions_store_nothing() {
        let h = harness(MockExecutor::new(), 5, Duration::from_secs(60));

        let cyclic = vec![
            StageDefinition::new("A", "agent").depends_on("B"),
            StageDefinition::new("B", "agent").depends_on("A"),
        ];
        let err = h
            .manager
            .create_workflow("wf", cyclic, Payload::new(), context())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CyclicDependency { .. }));

        let err = h
            .manager
            .create_workflow("wf", fan_out(), Payload::new(), SecurityContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidSecurityContext(_)));

        assert_eq!(h.manager.workflow_count().await, 0);
        assert!(h.transport.sent().await.is_empty());
        assert_eq!(h.manager.bus().pending_events().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_workflow_rejected() {
        let h = harness(MockExecutor::new(), 5, Duration::from_secs(60));
        h.manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap();
        let err = h
            .manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowExists(id) if id == "wf"));
        assert_eq!(h.manager.workflow_count().await, 1);
    }

    #[tokio::test]
    async fn test_only_pending_workflows_run() {
        let h = harness(succeed_all(), 5, Duration::from_secs(60));
        h.manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap();
        h.manager.execute_workflow("wf").await.unwrap();

        let err = h.manager.execute_workflow("wf").await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::NotRunnable { state: WorkflowState::Completed, .. }
        ));

        let err = h.manager.execute_workflow("missing").await.unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_recovers() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .withf(|agent_id, _, _| agent_id == "broken")
            .times(2)
            .returning(|agent_id, _, _| Err(StageError::fatal(agent_id, "backend down")));
        executor
            .expect_execute()
            .withf(|agent_id, _, _| agent_id == "healthy")
            .times(1)
            .returning(|_, _, _| Ok(json!("ok")));
        let h = harness(executor, 2, Duration::from_millis(100));

        for id in ["wf-1", "wf-2"] {
            h.manager
                .create_workflow(id, vec![StageDefinition::new("only", "broken")], Payload::new(), context())
                .await
                .unwrap();
            assert!(h.manager.execute_workflow(id).await.is_err());
        }
        assert_eq!(h.manager.circuit_state().await, CircuitState::Open);

        h.manager
            .create_workflow("wf-3", vec![StageDefinition::new("only", "healthy")], Payload::new(), context())
            .await
            .unwrap();
        let err = h.manager.execute_workflow("wf-3").await.unwrap_err();
        assert!(matches!(err, WorkflowError::CircuitOpen { .. }));
        assert_eq!(
            h.manager.get_workflow("wf-3").await.unwrap().state,
            WorkflowState::Pending
        );

        sleep(Duration::from_millis(150)).await;
        assert_eq!(h.manager.circuit_state().await, CircuitState::HalfOpen);

        let workflow = h.manager.execute_workflow("wf-3").await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Completed);
        assert_eq!(h.manager.circuit_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_apply_stage_update_is_idempotent() {
        let h = harness(succeed_all(), 5, Duration::from_secs(60));
        h.manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap();

        let changed = h
            .manager
            .apply_stage_update("wf", "A", StageState::Completed, None)
            .await
            .unwrap();
        assert!(changed);
        let again = h
            .manager
            .apply_stage_update("wf", "A", StageState::Completed, None)
            .await
            .unwrap();
        assert!(!again);

        let mut error_context = Payload::new();
        error_context.insert("error".to_string(), json!("late failure"));
        let flipped = h
            .manager
            .apply_stage_update("wf", "A", StageState::Failed, Some(error_context.clone()))
            .await
            .unwrap();
        assert!(flipped);
        let stage = h.manager.get_workflow("wf").await.unwrap().stage("A").cloned().unwrap();
        assert_eq!(stage.state, StageState::Failed);
        assert_eq!(stage.error_context, Some(error_context));

        assert!(!h
            .manager
            .apply_stage_update("gone", "A", StageState::Completed, None)
            .await
            .unwrap());
        assert!(matches!(
            h.manager
                .apply_stage_update("wf", "Z", StageState::Completed, None)
                .await,
            Err(WorkflowError::UnknownStage { .. })
        ));
    }

    #[tokio::test]
    async fn test_workflows_expire() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = Arc::new(EventBus::new(transport, EventBusConfig::default()));
        let manager = WorkflowManager::builder()
            .executor(Arc::new(MockExecutor::new()))
            .event_bus(bus)
            .config(WorkflowManagerConfig {
                cache_ttl: Duration::from_millis(50),
                ..WorkflowManagerConfig::default()
            })
            .build()
            .unwrap();

        manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .unwrap();
        sleep(Duration::from_millis(120)).await;

        assert!(manager.get_workflow("wf").await.is_none());
        assert_eq!(manager.workflow_count().await, 0);
        assert!(manager
            .create_workflow("wf", fan_out(), Payload::new(), context())
            .await
            .is_ok());
    }

    struct SlowExecutor;

    #[async_trait]
    impl AgentExecution for SlowExecutor {
        async fn execute(
            &self,
            agent_id: &str,
            _stage_config: &Payload,
            _security_context: &SecurityContext,
        ) -> std::result::Result<Value, StageError> {
            sleep(Duration::from_millis(150)).await;
            Ok(json!({"agent": agent_id}))
        }
    }

    #[tokio::test]
    async fn test_running_workflow_outlives_ttl() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = Arc::new(EventBus::new(transport.clone(), EventBusConfig::default()));
        let manager = WorkflowManager::builder()
            .executor(Arc::new(SlowExecutor))
            .event_bus(bus)
            .config(WorkflowManagerConfig {
                cache_ttl: Duration::from_millis(100),
                ..WorkflowManagerConfig::default()
            })
            .build()
            .unwrap();

        manager
            .create_workflow(
                "wf",
                vec![StageDefinition::new("A", "agent-a")],
                Payload::new(),
                context(),
            )
            .await
            .unwrap();

        let workflow = manager.execute_workflow("wf").await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Completed);
        assert_eq!(
            manager.get_workflow("wf").await.map(|w| w.state),
            Some(WorkflowState::Completed)
        );
        let types = transport.sent_types().await;
        assert!(types.contains(&"STAGE_COMPLETED".to_string()));
        assert!(types.contains(&"WORKFLOW_COMPLETED".to_string()));

        // Once finished it expires like any idle workflow.
        sleep(Duration::from_millis(200)).await;
        assert!(manager.get_workflow("wf").await.is_none());
    }

    #[test]
    fn test_builder_requires_components() {
        let err = WorkflowManager::builder().build().err().unwrap();
        assert!(matches!(err, WorkflowError::InitializationFailed(_)));
    }
}
