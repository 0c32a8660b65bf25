//! Stand-in agents for trying workflows out locally

use agent_core::{AgentExecution, Payload, SecurityContext, StageError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Executes stages by echoing them back
///
/// Stage config keys it understands: `delay_ms` sleeps before answering,
/// `fail: true` reports a retryable failure and `fatal: true` a
/// non-retryable one.
#[derive(Debug, Default)]
pub struct SimulatedExecutor;

#[async_trait]
impl AgentExecution for SimulatedExecutor {
    async fn execute(
        &self,
        agent_id: &str,
        stage_config: &Payload,
        security_context: &SecurityContext,
    ) -> Result<Value, StageError> {
        if let Some(delay) = stage_config.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let flag = |key: &str| stage_config.get(key).and_then(Value::as_bool) == Some(true);
        if flag("fatal") {
            return Err(StageError::fatal(agent_id, "simulated fatal failure"));
        }
        if flag("fail") {
            return Err(StageError::new(agent_id, "simulated failure")
                .with_details(json!({"config": stage_config})));
        }

        debug!("Simulated agent '{}' handled stage", agent_id);
        Ok(json!({
            "agent_id": agent_id,
            "user_id": security_context.user_id(),
            "echo": stage_config,
        }))
    }
}
