//! Agent coordinator
//!
//! The single entry point callers use: it registers agents against the
//! resource capacity, checks that a workflow's agents are live before handing
//! it to the workflow manager, keeps the manager's view in sync with stage
//! events and reports aggregate health.

use crate::error::{CoordinatorError, Result};
use crate::handlers::{StageEventHandler, WorkflowCounters, WorkflowEventHandler};
use crate::health::{AgentCounts, HealthReport, HealthStatus};
use crate::registry::{AgentRegistration, AgentSpec, AgentStatus};
use crate::resources::ResourceLedger;
use agent_core::{
    AgentDirectory, AgentMetadata, CircuitBreaker, CircuitBreakerConfig, Payload, SecurityContext,
};
use agent_events::{EventBus, EventHandler, EventType, SubscriptionId};
use agent_utils::Config;
use agent_workflow::{StageDefinition, Workflow, WorkflowError, WorkflowManager};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacity per resource type
    pub resource_capacity: HashMap<String, f64>,
    /// Interval of the background health loop
    pub health_check_interval: Duration,
    /// Breaker guarding agent directory lookups
    pub directory_breaker: CircuitBreakerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CoordinatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            resource_capacity: config.resource_capacity.clone(),
            health_check_interval: Duration::from_secs(
                config.coordinator.health_check_interval_seconds.max(1),
            ),
            directory_breaker: CircuitBreakerConfig::from(&config.circuit_breaker),
        }
    }
}

// Registrations and the ledger change together under one lock.
struct Registry {
    agents: HashMap<String, AgentRegistration>,
    ledger: ResourceLedger,
    // Workflow runs in flight per agent.
    runs: HashMap<String, usize>,
}

impl Registry {
    // Every agent must be active. Agents whose allocation was released by an
    // earlier run get it back, all of them or none.
    fn acquire_for_run(&mut self, agent_ids: &[String]) -> Result<()> {
        let mut missing: Vec<&String> = Vec::new();
        let mut combined: BTreeMap<String, f64> = BTreeMap::new();
        for agent_id in agent_ids {
            let registration = self
                .agents
                .get(agent_id)
                .filter(|a| a.is_active())
                .ok_or_else(|| CoordinatorError::AgentNotRegistered(agent_id.clone()))?;
            if self.runs.get(agent_id).copied().unwrap_or(0) == 0
                && registration.resources.is_empty()
            {
                missing.push(agent_id);
                for (resource_type, amount) in &registration.spec.resource_requirements {
                    *combined.entry(resource_type.clone()).or_insert(0.0) += amount;
                }
            }
        }
        self.ledger.check(&combined)?;

        let Registry { agents, ledger, runs } = self;
        for agent_id in missing {
            if let Some(registration) = agents.get_mut(agent_id) {
                registration.resources = ledger.allocate(&registration.spec.resource_requirements)?;
            }
        }
        for agent_id in agent_ids {
            *runs.entry(agent_id.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    // Release the allocation of every agent no other run still uses.
    fn release_after_run(&mut self, agent_ids: &[String]) -> Vec<String> {
        let Registry { agents, ledger, runs } = self;
        let mut released = Vec::new();
        for agent_id in agent_ids {
            let Some(count) = runs.get_mut(agent_id) else {
                continue;
            };
            *count -= 1;
            if *count > 0 {
                continue;
            }
            runs.remove(agent_id);
            if let Some(registration) = agents.get_mut(agent_id) {
                if !registration.resources.is_empty() {
                    ledger.release(&registration.resources);
                    registration.resources.clear();
                    released.push(agent_id.clone());
                }
            }
        }
        released
    }
}

/// Registers agents, allocates their resources and runs workflows
///
/// # Example
///
/// ```no_run
/// use agent_coordinator::AgentCoordinator;
/// use agent_core::SecurityContext;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example(manager: Arc<agent_workflow::WorkflowManager>) -> agent_coordinator::Result<()> {
/// let coordinator = Arc::new(AgentCoordinator::builder().manager(manager).build()?);
/// coordinator.start().await?;
///
/// let context = SecurityContext::new()
///     .with_user_id("ops")
///     .with_permissions(["agent:register"]);
/// let config = json!({
///     "type": "llm",
///     "capabilities": ["summarize"],
///     "resource_requirements": {"cpu": 1}
/// });
/// coordinator
///     .register_agent("writer", config.as_object().cloned().unwrap_or_default(), &context)
///     .await?;
///
/// coordinator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct AgentCoordinator {
    manager: Arc<WorkflowManager>,
    bus: Arc<EventBus>,
    directory: Option<Arc<dyn AgentDirectory>>,
    config: CoordinatorConfig,
    registry: Mutex<Registry>,
    directory_breaker: Mutex<CircuitBreaker>,
    counters: Arc<WorkflowCounters>,
    subscriptions: Mutex<Vec<(EventType, SubscriptionId)>>,
    shutdown: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentCoordinator {
    /// Create a new coordinator
    pub fn new(
        manager: Arc<WorkflowManager>,
        directory: Option<Arc<dyn AgentDirectory>>,
        config: CoordinatorConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus: Arc::clone(manager.bus()),
            manager,
            directory,
            registry: Mutex::new(Registry {
                agents: HashMap::new(),
                ledger: ResourceLedger::new(config.resource_capacity.clone()),
                runs: HashMap::new(),
            }),
            directory_breaker: Mutex::new(CircuitBreaker::new(
                "agent-directory",
                config.directory_breaker.clone(),
            )),
            config,
            counters: Arc::new(WorkflowCounters::default()),
            subscriptions: Mutex::new(Vec::new()),
            shutdown,
            health_task: Mutex::new(None),
        }
    }

    /// Create a new coordinator builder
    pub fn builder() -> AgentCoordinatorBuilder {
        AgentCoordinatorBuilder::new()
    }

    /// Get a reference to the workflow manager
    pub fn manager(&self) -> &Arc<WorkflowManager> {
        &self.manager
    }

    /// Get a reference to the event bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Get a reference to the coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Subscribe the coordinator's handlers and start the background loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if subscriptions.is_empty() {
                let stage_handler: Arc<dyn EventHandler> =
                    Arc::new(StageEventHandler::new(Arc::clone(&self.manager)));
                let workflow_handler: Arc<dyn EventHandler> =
                    Arc::new(WorkflowEventHandler::new(Arc::clone(&self.counters)));

                for (event_type, handler) in [
                    (EventType::StageCompleted, &stage_handler),
                    (EventType::StageFailed, &stage_handler),
                    (EventType::WorkflowCompleted, &workflow_handler),
                    (EventType::WorkflowFailed, &workflow_handler),
                ] {
                    let id = self.bus.subscribe(event_type, Arc::clone(handler)).await?;
                    subscriptions.push((event_type, id));
                }
            }
        }

        self.bus.start().await;
        self.start_health_loop().await;
        info!("Agent coordinator started");
        Ok(())
    }

    /// Register an agent and allocate its resources
    ///
    /// The registry lock is held from the capacity check through the
    /// directory lookup to the commit, so concurrent registrations cannot
    /// both claim the same capacity. A rejected registration allocates
    /// nothing.
    ///
    /// # Errors
    ///
    /// `InvalidSecurityContext`, `InvalidAgentConfig`,
    /// `AgentAlreadyRegistered`, `InsufficientResources`, `CircuitOpen`,
    /// `AgentNotFound` or `Directory`.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        config: Payload,
        security_context: &SecurityContext,
    ) -> Result<AgentRegistration> {
        security_context.validate()?;
        let spec = AgentSpec::from_config(agent_id, &config)?;

        let registration = {
            let mut registry = self.registry.lock().await;
            if registry.agents.contains_key(agent_id) {
                return Err(CoordinatorError::AgentAlreadyRegistered(agent_id.to_string()));
            }
            registry.ledger.check(&spec.resource_requirements)?;

            let metadata = self.lookup_agent(agent_id).await?;

            let resources = registry.ledger.allocate(&spec.resource_requirements)?;
            let registration = AgentRegistration {
                agent_id: agent_id.to_string(),
                config,
                spec,
                status: AgentStatus::Active,
                resources,
                registered_at: Utc::now(),
                metadata,
            };
            registry
                .agents
                .insert(agent_id.to_string(), registration.clone());
            registration
        };

        info!(
            "Registered agent '{}' ({}) holding {:?}",
            agent_id,
            registration.spec.agent_type,
            registration.spec.resource_requirements
        );
        self.announce(
            EventType::AgentRegistered,
            json!({
                "agent_id": agent_id,
                "agent_type": registration.spec.agent_type,
                "capabilities": registration.spec.capabilities,
                "resources": registration.spec.resource_requirements,
                "user_id": security_context.user_id(),
            }),
        )
        .await;

        Ok(registration)
    }

    /// Remove an agent and release everything it holds
    pub async fn deregister_agent(&self, agent_id: &str) -> Result<AgentRegistration> {
        let registration = {
            let mut registry = self.registry.lock().await;
            let registration = registry
                .agents
                .remove(agent_id)
                .ok_or_else(|| CoordinatorError::AgentNotRegistered(agent_id.to_string()))?;
            registry.ledger.release(&registration.resources);
            registry.runs.remove(agent_id);
            registration
        };

        info!("Deregistered agent '{}'", agent_id);
        self.announce(
            EventType::AgentDeregistered,
            json!({"agent_id": agent_id}),
        )
        .await;
        Ok(registration)
    }

    /// Release an agent's resources and keep it registered as inactive
    pub async fn deactivate_agent(&self, agent_id: &str) -> Result<AgentRegistration> {
        let registration = {
            let mut registry = self.registry.lock().await;
            let Registry { agents, ledger, .. } = &mut *registry;
            let registration = agents
                .get_mut(agent_id)
                .ok_or_else(|| CoordinatorError::AgentNotRegistered(agent_id.to_string()))?;
            if registration.status == AgentStatus::Inactive {
                return Ok(registration.clone());
            }
            ledger.release(&registration.resources);
            registration.resources.clear();
            registration.status = AgentStatus::Inactive;
            registration.clone()
        };

        info!("Agent '{}' deactivated", agent_id);
        self.announce_status(agent_id, AgentStatus::Inactive).await;
        Ok(registration)
    }

    /// Re-allocate an inactive agent's resources and mark it active
    pub async fn activate_agent(&self, agent_id: &str) -> Result<AgentRegistration> {
        let registration = {
            let mut registry = self.registry.lock().await;
            let Registry { agents, ledger, .. } = &mut *registry;
            let registration = agents
                .get_mut(agent_id)
                .ok_or_else(|| CoordinatorError::AgentNotRegistered(agent_id.to_string()))?;
            if registration.status == AgentStatus::Active {
                return Ok(registration.clone());
            }
            registration.resources = ledger.allocate(&registration.spec.resource_requirements)?;
            registration.status = AgentStatus::Active;
            registration.clone()
        };

        info!("Agent '{}' activated", agent_id);
        self.announce_status(agent_id, AgentStatus::Active).await;
        Ok(registration)
    }

    /// Snapshot of one registration
    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.registry.lock().await.agents.get(agent_id).cloned()
    }

    /// Snapshot of every registration, sorted by id
    pub async fn list_agents(&self) -> Vec<AgentRegistration> {
        let mut agents: Vec<AgentRegistration> =
            self.registry.lock().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Amount of a resource type currently allocated
    pub async fn allocated(&self, resource_type: &str) -> f64 {
        self.registry.lock().await.ledger.allocated(resource_type)
    }

    /// Define a workflow through the workflow manager
    pub async fn define_workflow(
        &self,
        workflow_id: impl Into<String>,
        stages: Vec<StageDefinition>,
        config: Payload,
        security_context: SecurityContext,
    ) -> Result<Workflow> {
        Ok(self
            .manager
            .create_workflow(workflow_id, stages, config, security_context)
            .await?)
    }

    /// Run a workflow once every agent it needs is registered and active
    ///
    /// Agents whose allocation was released by an earlier run re-acquire it
    /// first. When the run completes or fails, each agent's allocation is
    /// released unless another run still uses that agent.
    ///
    /// # Errors
    ///
    /// `AgentNotRegistered` for the first missing or inactive agent,
    /// `InsufficientResources` when released allocations cannot be
    /// re-acquired, or any error of [`WorkflowManager::execute_workflow`].
    pub async fn run_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let workflow = self
            .manager
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        let agent_ids: Vec<String> = workflow
            .agent_ids()
            .into_iter()
            .map(str::to_string)
            .collect();

        self.registry.lock().await.acquire_for_run(&agent_ids)?;
        debug!("All agents of workflow '{}' are active", workflow_id);

        let outcome = self.manager.execute_workflow(workflow_id).await;

        let released = self.registry.lock().await.release_after_run(&agent_ids);
        if !released.is_empty() {
            info!(
                "Workflow '{}' finished, released resources of {}",
                workflow_id,
                released.join(", ")
            );
        }
        Ok(outcome?)
    }

    /// Aggregate health of agents, resources, breakers and the bus
    pub async fn health(&self) -> HealthReport {
        let (agents, resources) = {
            let registry = self.registry.lock().await;
            let active = registry.agents.values().filter(|a| a.is_active()).count();
            let counts = AgentCounts {
                total: registry.agents.len(),
                active,
                inactive: registry.agents.len() - active,
            };
            (counts, registry.ledger.usage())
        };
        let workflow_circuit = self.manager.circuit_snapshot().await;
        let directory_circuit = self.directory_breaker.lock().await.snapshot();

        HealthReport {
            status: HealthStatus::evaluate(&workflow_circuit, &directory_circuit, &resources),
            agents,
            resources,
            workflow_circuit,
            directory_circuit,
            tracked_workflows: self.manager.workflow_count().await,
            pending_events: self.bus.pending_events().await,
            workflows_completed: self.counters.completed(),
            workflows_failed: self.counters.failed(),
            checked_at: Utc::now(),
        }
    }

    /// Stop the loops, deregister every agent and shut the bus down
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.health_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Health loop ended abnormally: {}", e);
            }
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for (event_type, id) in subscriptions {
            if let Err(e) = self.bus.unsubscribe(event_type, id).await {
                warn!("Failed to unsubscribe from {}: {}", event_type, e);
            }
        }

        let agent_ids: Vec<String> = self.registry.lock().await.agents.keys().cloned().collect();
        for agent_id in agent_ids {
            if let Err(e) = self.deregister_agent(&agent_id).await {
                warn!("Failed to deregister agent '{}': {}", agent_id, e);
            }
        }

        self.bus.shutdown().await;
        info!("Agent coordinator shut down");
    }

    async fn lookup_agent(&self, agent_id: &str) -> Result<Option<AgentMetadata>> {
        let Some(directory) = &self.directory else {
            return Ok(None);
        };
        self.directory_breaker.lock().await.try_acquire()?;

        let result = directory.get_agent(agent_id).await;
        let mut breaker = self.directory_breaker.lock().await;
        match result {
            Ok(Some(metadata)) => {
                breaker.record_success();
                Ok(Some(metadata))
            }
            Ok(None) => {
                breaker.record_success();
                Err(CoordinatorError::AgentNotFound(agent_id.to_string()))
            }
            Err(e) => {
                breaker.record_failure();
                warn!("Directory lookup for '{}' failed: {}", agent_id, e);
                Err(CoordinatorError::Directory(e.to_string()))
            }
        }
    }

    async fn start_health_loop(self: &Arc<Self>) {
        let mut task = self.health_task.lock().await;
        if task.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.config.health_check_interval;

        *task = Some(tokio::spawn(async move {
            if *shutdown_rx.borrow_and_update() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(coordinator) = weak.upgrade() else { break };
                        coordinator.report_health().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health loop stopped");
        }));
    }

    async fn report_health(&self) {
        let report = self.health().await;
        info!(
            "Health {:?}: {} agent(s) active, {} workflow(s) tracked, {} event(s) pending",
            report.status, report.agents.active, report.tracked_workflows, report.pending_events
        );

        let payload = match serde_json::to_value(&report) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Payload::new(),
            Err(e) => {
                warn!("Failed to serialize health report: {}", e);
                return;
            }
        };
        if let Err(e) = self.bus.publish(EventType::HealthCheck, payload, true).await {
            warn!("Failed to publish {}: {}", EventType::HealthCheck, e);
        }
    }

    async fn announce_status(&self, agent_id: &str, status: AgentStatus) {
        self.announce(
            EventType::AgentStatusChanged,
            json!({"agent_id": agent_id, "status": status}),
        )
        .await;
    }

    async fn announce(&self, event_type: EventType, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        if let Err(e) = self.bus.publish(event_type, payload, false).await {
            warn!("Failed to publish {}: {}", event_type, e);
        }
    }
}

/// Builder for AgentCoordinator
pub struct AgentCoordinatorBuilder {
    manager: Option<Arc<WorkflowManager>>,
    directory: Option<Arc<dyn AgentDirectory>>,
    config: CoordinatorConfig,
}

impl AgentCoordinatorBuilder {
    /// Create a new coordinator builder
    pub fn new() -> Self {
        Self {
            manager: None,
            directory: None,
            config: CoordinatorConfig::default(),
        }
    }

    /// Set the workflow manager; the coordinator shares its event bus
    pub fn manager(mut self, manager: Arc<WorkflowManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Set the agent directory consulted at registration
    pub fn directory(mut self, directory: Arc<dyn AgentDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the coordinator configuration
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the capacity of one resource type
    pub fn capacity(mut self, resource_type: impl Into<String>, amount: f64) -> Self {
        self.config
            .resource_capacity
            .insert(resource_type.into(), amount);
        self
    }

    /// Replace every resource capacity
    pub fn capacities(mut self, capacity: impl IntoIterator<Item = (String, f64)>) -> Self {
        self.config.resource_capacity = capacity.into_iter().collect();
        self
    }

    /// Build the coordinator
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow manager is not set
    pub fn build(self) -> Result<AgentCoordinator> {
        let manager = self.manager.ok_or_else(|| {
            CoordinatorError::InitializationFailed("Workflow manager not set".to_string())
        })?;
        Ok(AgentCoordinator::new(manager, self.directory, self.config))
    }
}

impl Default for AgentCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
