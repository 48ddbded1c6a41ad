//! `pnp` command-line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pnp_core::config::Settings;
use pnp_core::experiment::StartOutcome;
use pnp_core::machine::Machine;
use pnp_core::state::RunState;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pnp", version, about = "SMD pick-and-place controller")]
struct Cli {
    /// Configuration file (defaults to ./pnp.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a JSON plan: [{"part": "R1", "targetPad": "A"}, ...]
    Run {
        /// Plan file
        plan: PathBuf,
    },
    /// Trigger one test-station measurement
    Measure,
    /// Print the current status snapshot
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut machine = Machine::from_settings(settings);
    machine.startup().await;

    let outcome = match cli.command {
        Command::Run { plan } => run_plan(&machine, &plan).await,
        Command::Measure => {
            let result = machine.measure().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Status => Ok(()),
    };

    machine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&machine.snapshot())?);
    outcome
}

async fn run_plan(machine: &Machine, path: &std::path::Path) -> Result<()> {
    let plan = machine
        .load_plan_file(path)
        .with_context(|| format!("Failed to load plan {}", path.display()))?;
    info!("Loaded {} plan items from {}", plan.len(), path.display());

    match machine.start() {
        StartOutcome::Started { .. } => {}
        other => anyhow::bail!("Plan did not start: {:?}", other),
    }

    tokio::select! {
        _ = machine.executor().wait() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping plan");
            machine.stop();
            machine.executor().wait().await;
        }
    }

    let status = machine.store().robot().get();
    match status.state {
        RunState::Error => anyhow::bail!("Plan failed at '{}'", status.current_task),
        state => {
            info!("Plan ended: {:?} ({})", state, status.current_task);
            Ok(())
        }
    }
}
