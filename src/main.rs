//! fleet-control - coordination node for a fleet of mining turtles
//!
//! Owns the radio, the agent table and the task backlog. Operator actions
//! are read as JSON lines on stdin.
//!
//! # Usage
//!
//! ```bash
//! # Run with ./fleet_config.toml or built-in defaults
//! cargo run --release --bin fleet-control
//!
//! # Queue work from the shell
//! echo '{"action":"queue_task","task":{"type":"resource_target","resource":"diamond","quantity":64}}' \
//!   | ./fleet-control --config fleet.toml
//!
//! # Drive it with simulated turtles
//! ./fleet-sim --turtles 5
//! ```
//!
//! # Environment Variables
//!
//! - `FLEET_CONFIG`: path to the TOML config (default: ./fleet_config.toml)
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleet_control::commands::{CommandCatalog, CommandDispatcher};
use fleet_control::config::ControlConfig;
use fleet_control::node::{read_operator_lines, ControlLoop};
use fleet_control::storage::SledAgentStore;
use fleet_control::transport::{self, Transport};

const INBOUND_QUEUE: usize = 1024;
const OPERATOR_QUEUE: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fleet-control")]
#[command(about = "Coordination node for a fleet of mining turtles")]
#[command(version)]
struct CliArgs {
    /// Config file (overrides $FLEET_CONFIG and ./fleet_config.toml)
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Directory for the agent database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep the agent table in memory only
    #[arg(long)]
    no_persist: bool,

    /// Do not read operator commands from stdin
    #[arg(long)]
    no_stdin: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Validate the effective configuration and print it
    CheckConfig,
}

// ============================================================================
// Supervised tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskName {
    Transport,
    ControlLoop,
    OperatorInput,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Transport => write!(f, "Transport"),
            TaskName::ControlLoop => write!(f, "ControlLoop"),
            TaskName::OperatorInput => write!(f, "OperatorInput"),
        }
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn load_config(args: &CliArgs) -> Result<ControlConfig> {
    let mut config = match &args.config {
        Some(path) => ControlConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ControlConfig::load(),
    };
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if args.no_persist {
        config.storage.enabled = false;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Run the supervisor loop: monitor tasks, cancel everything once one ends.
async fn run_supervisor(task_set: &mut JoinSet<Result<TaskName>>, cancel_token: CancellationToken) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    let outcome = loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break Ok(());
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(TaskName::OperatorInput))) => {
                        info!("Supervisor: operator input finished, node keeps running");
                    }
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "Supervisor: task completed, shutting down");
                        cancel_token.cancel();
                        break Ok(());
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Supervisor: task failed");
                        cancel_token.cancel();
                        break Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Supervisor: task panicked");
                        cancel_token.cancel();
                        break Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break Ok(());
                    }
                }
            }
        }
    };

    // Let the control loop save the agent table before exiting
    let drain = async {
        while let Some(joined) = task_set.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "Task ended with error during shutdown");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Supervisor: tasks still running after grace period, aborting");
        task_set.abort_all();
    }

    outcome
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.json_logs);

    let config = load_config(&args)?;

    if let Some(SubCommand::CheckConfig) = &args.command {
        println!("{}", config.to_toml()?);
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        node_id = config.node.id,
        hostname = %config.node.hostname,
        protocol = %config.node.protocol,
        service = %config.node.service,
        "Starting fleet control node"
    );

    // Radio
    let modem = transport::open_configured(&config.transport).context("No radio interface could be opened")?;
    let (radio, mut handle) = Transport::new(modem, &config.node);
    if let Err(e) = handle.advertise(&config.node.service, &config.node.hostname) {
        warn!(error = %e, "Initial service announcement failed");
    }

    // Control loop
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let (operator_tx, operator_rx) = mpsc::channel(OPERATOR_QUEUE);
    let dispatcher = CommandDispatcher::new(CommandCatalog::standard(), handle);
    let mut control = ControlLoop::new(&config, dispatcher, inbound_rx, operator_rx);
    if config.storage.enabled {
        let path = config.storage.agent_db_path();
        std::fs::create_dir_all(&config.storage.data_dir)
            .with_context(|| format!("Failed to create {}", config.storage.data_dir.display()))?;
        let store = SledAgentStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        control = control.with_store(Box::new(store))?;
    } else {
        info!("Persistence disabled, agent table lives in memory only");
    }

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    let radio_cancel = cancel_token.clone();
    task_set.spawn(async move {
        radio.run(inbound_tx, radio_cancel).await?;
        Ok(TaskName::Transport)
    });

    let loop_cancel = cancel_token.clone();
    task_set.spawn(async move {
        let stats = control.run(loop_cancel).await;
        info!(messages = stats.messages, events = stats.events, "Control loop summary");
        Ok(TaskName::ControlLoop)
    });

    if !args.no_stdin {
        let input_cancel = cancel_token.clone();
        task_set.spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            read_operator_lines(stdin, operator_tx, input_cancel).await?;
            Ok(TaskName::OperatorInput)
        });
    }

    run_supervisor(&mut task_set, cancel_token).await
}
