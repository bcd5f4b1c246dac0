use clap::{Parser, Subcommand};
use conductor_core::{system_clock, AgentType};
use conductor_orchestrator::{
    workflow_catalog, CompletionMarker, Conductor, OrchestratorConfig, Params, TaskPriority,
    TaskStatus,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: task orchestration for a fixed agent roster")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every background worker until interrupted
    Serve,
    /// Print the system overview as JSON
    Overview,
    /// Create one task and run until it finishes
    Task {
        /// Target agent, e.g. `email`
        #[arg(long)]
        agent: String,
        /// Task type, e.g. `send_email`
        #[arg(long = "type")]
        task_type: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Parameters as key=value; values are parsed as JSON when possible
        #[arg(long = "param")]
        params: Vec<String>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
    /// Inspect or run catalog workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Inspect or change resource leases
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Drop a completion marker on behalf of an agent
    Complete {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: Uuid,
        /// Report the task as failed
        #[arg(long)]
        failed: bool,
        /// Result payload as JSON
        #[arg(long)]
        result: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List catalog workflows
    List,
    /// Run a workflow and wait for its tasks
    Run {
        name: String,
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Take or refresh a lease
    Acquire {
        key: String,
        holder: String,
        /// Lease length in seconds (defaults to config)
        #[arg(long)]
        lease_secs: Option<u64>,
    },
    /// Give a lease back
    Release { key: String, holder: String },
    /// Show the lease on one key
    Status { key: String },
    /// Show every valid lease
    List,
}

#[derive(Serialize)]
struct RunSummary {
    task_id: Uuid,
    status: Option<TaskStatus>,
}

/// Split `key=value` pairs into task params.
fn parse_params(pairs: &[String]) -> anyhow::Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Parameter '{pair}' is not key=value"))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Start the workers, wait for `ids` to finish and print where they ended.
async fn run_until_done(conductor: &Conductor, ids: &[Uuid], wait_secs: u64) -> anyhow::Result<()> {
    let handle = conductor.start();
    let poll = conductor.config().intervals.completion().min(Duration::from_secs(1));
    let statuses = tokio::select! {
        statuses = conductor.orchestrator().wait_for_tasks(ids, Duration::from_secs(wait_secs), poll) => statuses,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted before tasks finished");
            ids.iter().map(|id| (*id, conductor.orchestrator().task_status(*id))).collect()
        }
    };
    handle.shutdown().await;

    let summary: Vec<RunSummary> = statuses
        .into_iter()
        .map(|(task_id, status)| RunSummary { task_id, status })
        .collect();
    print_json(&summary)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = OrchestratorConfig::load(&cli.config).await?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Serve => {
            let conductor = Conductor::new(config, system_clock()).await?;
            let handle = conductor.start();
            info!(data_dir = %conductor.config().data_dir.display(), "Conductor running, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            handle.shutdown().await;
        }
        Commands::Overview => {
            let conductor = Conductor::new(config, system_clock()).await?;
            print_json(&conductor.system_overview().await)?;
        }
        Commands::Task {
            agent,
            task_type,
            description,
            priority,
            params,
            wait_secs,
        } => {
            let conductor = Conductor::new(config, system_clock()).await?;
            let priority: TaskPriority = priority.parse()?;
            let id = conductor.orchestrator().create_task(
                &agent,
                &task_type,
                &description,
                priority,
                parse_params(&params)?,
            )?;
            info!(task_id = %id, "Task created, waiting for completion");
            run_until_done(&conductor, &[id], wait_secs).await?;
        }
        Commands::Workflow { action } => match action {
            WorkflowAction::List => {
                let catalog = workflow_catalog();
                println!("Workflows:");
                for workflow in &catalog {
                    let agents: Vec<&str> = workflow.agents.iter().map(AgentType::as_str).collect();
                    println!("  {}: {}", workflow.name, workflow.summary);
                    println!("    agents: {}", agents.join(", "));
                }
                println!("\nTotal: {} workflow(s)", catalog.len());
            }
            WorkflowAction::Run {
                name,
                params,
                wait_secs,
            } => {
                let conductor = Conductor::new(config, system_clock()).await?;
                let result = conductor
                    .orchestrator()
                    .execute_workflow(&name, parse_params(&params)?)?;
                if let Some(error) = &result.error {
                    warn!(workflow = %name, error = %error, "Workflow only partly created");
                }
                run_until_done(&conductor, &result.task_ids, wait_secs).await?;
            }
        },
        Commands::Lock { action } => {
            let lease_default = config.locks.default_lease_secs;
            let conductor = Conductor::new(config, system_clock()).await?;
            let locks = conductor.locks();
            match action {
                LockAction::Acquire {
                    key,
                    holder,
                    lease_secs,
                } => {
                    let lease = Duration::from_secs(lease_secs.unwrap_or(lease_default));
                    print_json(&locks.acquire_lock(&key, &holder, lease).await?)?;
                }
                LockAction::Release { key, holder } => {
                    print_json(&locks.release_lock(&key, &holder).await?)?;
                }
                LockAction::Status { key } => {
                    print_json(&locks.get_lock_status(&key).await?)?;
                }
                LockAction::List => {
                    print_json(&locks.get_all_locked_files().await?)?;
                }
            }
        }
        Commands::Complete {
            agent,
            task_id,
            failed,
            result,
        } => {
            let agent: AgentType = agent.parse()?;
            let payload = match result {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::json!({}),
            };
            let marker = if failed {
                CompletionMarker::failed(task_id, payload)
            } else {
                CompletionMarker::completed(task_id, payload)
            };
            let dir = config.completed_dir();
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(format!("{agent}_{task_id}.json"));
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, serde_json::to_vec_pretty(&marker)?).await?;
            tokio::fs::rename(&tmp, &path).await?;
            println!("Marker written to {}", path.display());
        }
    }

    Ok(())
}
