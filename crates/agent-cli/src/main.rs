//! Command-line interface for agent-rs

mod simulated;
mod workflow_file;

use agent_coordinator::{AgentCoordinator, CoordinatorConfig};
use agent_events::{EventBus, EventBusConfig, InMemoryTransport, SentEvent};
use agent_utils::Config;
use agent_workflow::{StageGraph, Workflow, WorkflowManager, WorkflowManagerConfig};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use simulated::SimulatedExecutor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use workflow_file::WorkflowFile;

#[derive(Parser, Debug)]
#[command(name = "agent-cli")]
#[command(about = "Validate and run agent workflows locally", long_about = None)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a workflow file and print its execution order
    Validate {
        /// Workflow file
        file: PathBuf,
    },
    /// Run a workflow file against simulated agents
    Run {
        /// Workflow file
        file: PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    agent_utils::init_tracing_with(&config.logging);

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Run { file, json } => run(&file, config, json).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let file = WorkflowFile::from_file(path)?;
    let graph = StageGraph::build(&file.stages)
        .with_context(|| format!("workflow '{}' is invalid", file.workflow_id))?;

    println!(
        "Workflow '{}' is valid ({} stages)",
        file.workflow_id,
        graph.len()
    );
    for (position, stage_id) in graph.ordered_ids().iter().enumerate() {
        println!("  {}. {}", position + 1, stage_id);
    }
    Ok(())
}

async fn run(path: &Path, config: Config, as_json: bool) -> anyhow::Result<()> {
    let file = WorkflowFile::from_file(path)?;

    let transport = Arc::new(InMemoryTransport::new());
    let bus = Arc::new(EventBus::new(
        transport.clone(),
        EventBusConfig::from(&config.event_bus),
    ));
    let manager = WorkflowManager::builder()
        .executor(Arc::new(SimulatedExecutor))
        .event_bus(bus)
        .config(WorkflowManagerConfig::from(&config))
        .build()?;
    let coordinator = Arc::new(
        AgentCoordinator::builder()
            .manager(Arc::new(manager))
            .config(CoordinatorConfig::from(&config))
            .build()?,
    );
    coordinator.start().await?;

    let outcome = execute(&coordinator, &file).await;
    let workflow = coordinator.manager().get_workflow(&file.workflow_id).await;
    coordinator.shutdown().await;
    let events = transport.sent().await;

    if as_json {
        let report = json!({
            "workflow": workflow,
            "events": events.iter().map(|e| &e.detail).collect::<Vec<_>>(),
            "error": outcome.as_ref().err().map(|e| format!("{e:#}")),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(workflow) = &workflow {
            print_workflow(workflow);
        }
        print_events(&events);
    }

    outcome.map(|_| ())
}

async fn execute(coordinator: &AgentCoordinator, file: &WorkflowFile) -> anyhow::Result<Workflow> {
    for agent in &file.agents {
        coordinator
            .register_agent(&agent.agent_id, agent.config.clone(), &file.security_context)
            .await
            .with_context(|| format!("failed to register agent '{}'", agent.agent_id))?;
    }

    coordinator
        .define_workflow(
            file.workflow_id.clone(),
            file.stages.clone(),
            file.config.clone(),
            file.security_context.clone(),
        )
        .await
        .with_context(|| format!("failed to define workflow '{}'", file.workflow_id))?;

    info!("Running workflow '{}'", file.workflow_id);
    match coordinator.run_workflow(&file.workflow_id).await {
        Ok(workflow) => Ok(workflow),
        Err(e) => {
            warn!("Workflow '{}' did not complete: {}", file.workflow_id, e);
            Err(e).with_context(|| format!("workflow '{}' failed", file.workflow_id))
        }
    }
}

fn print_workflow(workflow: &Workflow) {
    println!("Workflow '{}': {}", workflow.workflow_id, workflow.state);
    for stage in workflow.ordered_stages() {
        println!(
            "  {:<20} {:<10} agent={} attempts={}",
            stage.stage_id, stage.state, stage.agent_id, stage.attempts
        );
        if let Some(error) = stage.error_context.as_ref().and_then(|c| c.get("error")) {
            println!("  {:<20} error: {}", "", error);
        }
    }
    if let Some(duration) = workflow.metrics.duration_ms {
        println!("  took {duration} ms");
    }
}

fn print_events(events: &[SentEvent]) {
    println!("Events ({}):", events.len());
    for event in events {
        println!("  {} {}", event.ack_id, event.event_type);
    }
}
