//! Submitting and driving runs — `sysrev submit`, `sysrev run`, `sysrev run-all`.

use anyhow::{Result, bail};
use std::path::Path;

use sysrev::RunOutcome;
use sysrev::config::SysrevConfig;
use sysrev::run_config::RunConfig;

use super::orchestrator;

pub async fn cmd_submit(config: &SysrevConfig, path: &Path, run_now: bool) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let run_config = RunConfig::load(path)?;
    let run = orchestrator.submit(run_config).await?;

    println!("{}", run.run_id);
    eprintln!(
        "{} run for: {}",
        console::style("Submitted").green().bold(),
        run.config.research_question
    );

    if run_now {
        let outcome = orchestrator.drive(&run.run_id).await?;
        return report_outcome(&run.run_id, &outcome);
    }
    Ok(())
}

pub async fn cmd_run(config: &SysrevConfig, run_id: &str, steal_lease: bool) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    if steal_lease && let Some(previous) = orchestrator.steal_lease(run_id).await? {
        eprintln!(
            "{} lease held by {}",
            console::style("Released").yellow(),
            previous
        );
    }

    let outcome = orchestrator.drive(run_id).await?;
    report_outcome(run_id, &outcome)
}

pub async fn cmd_run_all(config: &SysrevConfig) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let run_ids = orchestrator.drivable_runs().await?;
    if run_ids.is_empty() {
        println!("No runs to drive.");
        return Ok(());
    }

    println!(
        "Driving {} run(s), at most {} at a time",
        run_ids.len(),
        config.toml.orchestrator.max_concurrent_runs
    );
    println!();

    let mut unfinished = 0;
    for (run_id, result) in orchestrator.drive_many(run_ids).await {
        match result {
            Ok(RunOutcome::Completed) => {
                println!("  {} {}", console::style("✓").green(), run_id);
            }
            Ok(RunOutcome::Cancelled) => {
                println!("  {} {} cancelled", console::style("-").dim(), run_id);
            }
            Ok(outcome) => {
                unfinished += 1;
                println!("  {} {} {}", console::style("!").yellow(), run_id, outcome);
            }
            Err(e) => {
                unfinished += 1;
                println!("  {} {} {}", console::style("✗").red(), run_id, e);
            }
        }
    }
    println!();

    if unfinished > 0 {
        bail!("{} run(s) did not complete", unfinished);
    }
    Ok(())
}

/// Print the outcome; anything short of completion (or cancellation) is an error exit.
fn report_outcome(run_id: &str, outcome: &RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Completed => {
            println!("{} run {}", console::style("Completed").green().bold(), run_id);
            Ok(())
        }
        RunOutcome::Cancelled => {
            println!("Run {} was cancelled", run_id);
            Ok(())
        }
        RunOutcome::NeedsAction { stage, hint } => {
            println!(
                "{} at stage {}",
                console::style("Needs action").yellow().bold(),
                stage
            );
            println!("  {}", hint);
            bail!("Run {} needs action at stage {}", run_id, stage)
        }
        RunOutcome::Blocked(integrity) => {
            println!("{} {}", console::style("Blocked:").red().bold(), integrity);
            println!("  {}", integrity.remedy());
            bail!("Run {} cannot resume: {}", run_id, integrity)
        }
    }
}
