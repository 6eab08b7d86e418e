//! CLI command implementations.
//!
//! | Module     | Commands handled                                  |
//! |------------|---------------------------------------------------|
//! | `project`  | `Init`                                            |
//! | `config`   | `Config`                                          |
//! | `run`      | `Submit`, `Run`, `RunAll`                         |
//! | `status`   | `Status`, `List`, `Checkpoints`, `Progress`       |
//! | `manage`   | `Cancel`, `ResetStage`, `Delete`                  |

pub mod config;
pub mod manage;
pub mod project;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use manage::{cmd_cancel, cmd_delete, cmd_reset_stage};
pub use project::cmd_init;
pub use run::{cmd_run, cmd_run_all, cmd_submit};
pub use status::{cmd_checkpoints, cmd_list, cmd_progress, cmd_status};

use anyhow::{Result, bail};
use sysrev::RunOrchestrator;
use sysrev::checkpoint::{RunStatus, StageStatus};
use sysrev::config::SysrevConfig;

/// Build the orchestrator for an initialized project.
fn orchestrator(config: &SysrevConfig) -> Result<RunOrchestrator> {
    if !config.is_initialized() {
        bail!(
            "No .sysrev directory in {}. Run 'sysrev init' first.",
            config.project_dir.display()
        );
    }
    RunOrchestrator::from_config(config)
}

fn styled_run_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let s = console::style(status.as_str());
    match status {
        RunStatus::Completed => s.green(),
        RunStatus::Running => s.cyan(),
        RunStatus::NeedsAction => s.yellow().bold(),
        RunStatus::Failed => s.red(),
        RunStatus::Pending => s.dim(),
    }
}

fn styled_stage_status(status: StageStatus) -> console::StyledObject<&'static str> {
    let s = console::style(status.as_str());
    match status {
        StageStatus::Completed => s.green(),
        StageStatus::InProgress => s.cyan(),
        StageStatus::Failed => s.red(),
        StageStatus::Skipped => s.dim(),
        StageStatus::Pending => s,
    }
}
