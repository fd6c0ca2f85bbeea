//! Command-line front end of the Concord engine.

mod config;
mod fixtures;

use clap::{Parser, Subcommand};
use concord_core::{CognitiveSnapshot, ConcordConfig};
use concord_cost::{BudgetPolicy, CostController};
use concord_mesh::{CognitiveMesh, MeshHandle};
use concord_orchestrator::{Orchestrator, Request};
use concord_store::{Archive, StateStore};
use config::CliConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "concord", about = "Concord task orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "concord.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one request
    Ask {
        text: String,
        /// Never replace the remote tier with the local one
        #[arg(long)]
        requires_remote: bool,
        /// Approve any cost confirmation up front
        #[arg(long)]
        yes: bool,
    },
    /// Approve the pending charges of a plan and run it
    Confirm { plan_id: Uuid },
    /// Reject the pending charges of a plan
    Decline { plan_id: Uuid },
    /// Drive work left over by a previous process to completion
    Recover,
    /// Print the spend report of the current billing period
    Costs,
    /// Print active work and archive counts
    Status,
    /// Run the cognitive mesh and print its latest snapshots
    Mesh {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

#[derive(Serialize)]
struct ActiveItem {
    id: Uuid,
    plan_id: Option<Uuid>,
    domain: Option<String>,
    kind: String,
    status: String,
    iteration: u32,
    awaiting_confirmation: bool,
}

#[derive(Serialize)]
struct StatusReport {
    active: Vec<ActiveItem>,
    completed: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }

    let config = CliConfig::load(&cli.config).await?;
    let store = config.open_store().await?;

    match cli.command {
        Commands::Ask {
            text,
            requires_remote,
            yes,
        } => {
            let mesh = start_mesh(&store, &config.engine).await?;
            let orchestrator = build_orchestrator(&config, &store, &mesh)?;

            let mut request = Request::new(text);
            request.requires_remote = requires_remote;
            let mut response = orchestrator.handle(request).await;
            if response.requires_confirmation && yes {
                if let Some(plan_id) = response.plan_id {
                    info!(plan_id = %plan_id, "Auto-confirming plan");
                    response = orchestrator.confirm(plan_id).await;
                }
            }
            print_json(&response)?;
            mesh.shutdown().await;
        }
        Commands::Confirm { plan_id } => {
            let mesh = start_mesh(&store, &config.engine).await?;
            let orchestrator = build_orchestrator(&config, &store, &mesh)?;
            print_json(&orchestrator.confirm(plan_id).await)?;
            mesh.shutdown().await;
        }
        Commands::Decline { plan_id } => {
            let orchestrator = Orchestrator::builder(
                config.engine.clone(),
                Arc::clone(&store),
                Arc::new(fixtures::build_registry(&config.tools)),
            )
            .build()?;
            print_json(&orchestrator.decline(plan_id).await)?;
        }
        Commands::Recover => {
            let mesh = start_mesh(&store, &config.engine).await?;
            let orchestrator = build_orchestrator(&config, &store, &mesh)?;
            let report = orchestrator.recover().await?;
            print_json(&report)?;
            mesh.shutdown().await;
        }
        Commands::Costs => {
            let cost = CostController::new(Arc::clone(&store), BudgetPolicy::from(&config.engine));
            print_json(&cost.report().await?)?;
        }
        Commands::Status => {
            let active = store
                .list_active()
                .await?
                .into_iter()
                .map(|spec| ActiveItem {
                    id: spec.id,
                    plan_id: spec.plan_id,
                    domain: spec.domain.clone(),
                    kind: spec.kind.to_string(),
                    status: spec.status().to_string(),
                    iteration: spec.progress().iteration,
                    awaiting_confirmation: spec.awaiting_confirmation(),
                })
                .collect();
            let report = StatusReport {
                active,
                completed: store.list_archive(Archive::Completed).await?.len(),
                failed: store.list_archive(Archive::Failed).await?.len(),
            };
            print_json(&report)?;
        }
        Commands::Mesh { seconds } => {
            let mesh = start_mesh(&store, &config.engine).await?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            let latest = mesh.board().latest_all();
            let snapshots: BTreeMap<&str, &CognitiveSnapshot> = latest
                .iter()
                .map(|(agent, snapshot)| (agent.as_str(), snapshot.as_ref()))
                .collect();
            print_json(&snapshots)?;
            mesh.shutdown().await;
        }
    }

    Ok(())
}

async fn start_mesh(store: &Arc<dyn StateStore>, config: &ConcordConfig) -> anyhow::Result<MeshHandle> {
    let mut mesh = CognitiveMesh::builder(Arc::clone(store), config.cognitive.clone())
        .with_default_agents()
        .build()?;
    let restored = mesh.warm_start().await?;
    info!(restored, "Cognitive mesh warm start finished");
    Ok(mesh.start())
}

fn build_orchestrator(
    config: &CliConfig,
    store: &Arc<dyn StateStore>,
    mesh: &MeshHandle,
) -> anyhow::Result<Orchestrator> {
    let tools = Arc::new(fixtures::build_registry(&config.tools));
    let orchestrator = Orchestrator::builder(config.engine.clone(), Arc::clone(store), tools)
        .with_mesh(mesh.board(), mesh.observer())
        .build()?;
    Ok(orchestrator)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
