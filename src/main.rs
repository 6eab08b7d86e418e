use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sysrev::config::{LogFormat, SysrevConfig};
use sysrev::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "sysrev")]
#[command(version, about = "Resumable orchestrator for systematic-review pipelines")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(long, global = true, env = "SYSREV_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Log output format. Overrides sysrev.toml.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .sysrev/ in the project directory
    Init,
    /// Register a new run from a run config file (TOML or JSON)
    Submit {
        config: PathBuf,
        /// Drive the run immediately after submitting it
        #[arg(long)]
        run: bool,
    },
    /// Drive a run from its last checkpoint
    Run {
        run_id: String,
        /// Release another orchestrator's lease first (after a crash)
        #[arg(long)]
        steal_lease: bool,
    },
    /// Drive every resumable run concurrently
    RunAll,
    /// Show a run's status and per-stage summary
    Status {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List all runs
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show a run's stage checkpoints and cost ledger
    Checkpoints {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show progress snapshots for a run
    Progress {
        run_id: String,
        /// Only this stage
        stage: Option<String>,
    },
    /// Cancel a run; a stage already executing finishes first
    Cancel { run_id: String },
    /// Return a stage to PENDING so the next `run` re-executes it
    ResetStage { run_id: String, stage: String },
    /// Delete a run with its checkpoints, artifacts and progress
    Delete {
        run_id: String,
        /// Also delete runs that have not finished
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default sysrev.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // init and config init must work before any config exists.
    match &cli.command {
        Commands::Init => return cmd::cmd_init(&project_dir),
        Commands::Config { command } => return cmd::cmd_config(&project_dir, command.clone()),
        _ => {}
    }

    let config = SysrevConfig::new(project_dir)?.with_log_format(cli.log_format);
    let _guard = init_logging(
        &config.toml.logging,
        config.log_format(),
        cli.verbose,
        Some(&config.log_dir()),
    )?;

    match &cli.command {
        Commands::Init | Commands::Config { .. } => {}
        Commands::Submit { config: path, run } => cmd::cmd_submit(&config, path, *run).await?,
        Commands::Run {
            run_id,
            steal_lease,
        } => cmd::cmd_run(&config, run_id, *steal_lease).await?,
        Commands::RunAll => cmd::cmd_run_all(&config).await?,
        Commands::Status { run_id, json } => cmd::cmd_status(&config, run_id, *json).await?,
        Commands::List { json } => cmd::cmd_list(&config, *json).await?,
        Commands::Checkpoints { run_id, json } => {
            cmd::cmd_checkpoints(&config, run_id, *json).await?
        }
        Commands::Progress { run_id, stage } => {
            cmd::cmd_progress(&config, run_id, stage.as_deref())?
        }
        Commands::Cancel { run_id } => cmd::cmd_cancel(&config, run_id).await?,
        Commands::ResetStage { run_id, stage } => {
            cmd::cmd_reset_stage(&config, run_id, stage).await?
        }
        Commands::Delete { run_id, force } => cmd::cmd_delete(&config, run_id, *force).await?,
    }

    Ok(())
}
