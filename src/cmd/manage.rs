//! Operator actions on runs — `sysrev cancel`, `reset-stage`, `delete`.

use anyhow::{Result, bail};

use sysrev::config::SysrevConfig;
use sysrev::stage::StageName;

use super::orchestrator;

pub async fn cmd_cancel(config: &SysrevConfig, run_id: &str) -> Result<()> {
    let run = orchestrator(config)?.cancel(run_id).await?;
    println!("{} run {}", console::style("Cancelled").yellow().bold(), run.run_id);
    if run.lease.is_some() {
        println!("The stage currently executing will finish before the run stops.");
    }
    Ok(())
}

pub async fn cmd_reset_stage(config: &SysrevConfig, run_id: &str, stage: &str) -> Result<()> {
    let stage: StageName = stage.parse().map_err(anyhow::Error::msg)?;
    let orchestrator = orchestrator(config)?;
    let cp = orchestrator.reset_stage(run_id, stage).await?;
    println!(
        "Stage {} of run {} reset to {}",
        cp.stage,
        run_id,
        console::style(cp.status.as_str()).bold()
    );
    let stale = orchestrator.stale_dependents(run_id, stage).await?;
    if !stale.is_empty() {
        let names: Vec<&str> = stale.iter().map(|s| s.as_str()).collect();
        println!(
            "{} completed stages built on its old output are kept: {}",
            console::style("Note:").yellow().bold(),
            names.join(", ")
        );
        println!("Reset them too if they must be rebuilt.");
    }
    println!("Run `sysrev run {}` to re-execute it.", run_id);
    Ok(())
}

pub async fn cmd_delete(config: &SysrevConfig, run_id: &str, force: bool) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let run = orchestrator.store().get_run(run_id).await?;
    if !run.status.is_terminal() && !force {
        bail!(
            "Run {} is {}; pass --force to delete an unfinished run",
            run_id,
            run.status
        );
    }
    orchestrator.delete(run_id).await?;
    println!("Deleted run {}", run_id);
    Ok(())
}
