//! Read-only views of runs — `sysrev status`, `list`, `checkpoints`, `progress`.

use anyhow::{Context, Result};

use sysrev::config::SysrevConfig;
use sysrev::progress::{MemoryProgressSink, ProgressSink, ProgressSnapshot};
use sysrev::stage::StageName;

use super::{orchestrator, styled_run_status, styled_stage_status};

pub async fn cmd_status(config: &SysrevConfig, run_id: &str, json: bool) -> Result<()> {
    let view = orchestrator(config)?.status(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!();
    println!("{}", console::style(format!("Run {}", view.run_id)).bold().cyan());
    println!("  Question:   {}", view.research_question);
    println!("  Status:     {}", styled_run_status(view.status));
    if let Some(stage) = view.current_stage {
        println!("  Stage:      {}", stage);
    }
    println!("  Total cost: {:.4}", view.total_cost);
    if let Some(owner) = &view.leased_by {
        println!("  Leased by:  {}", owner);
    }
    if let Some(hint) = &view.action_hint {
        println!("  {} {}", console::style("Action:").yellow().bold(), hint);
    }
    println!();
    println!("{:<14} {:<12} {:>7} {:>9}", "Stage", "Status", "Retries", "Cost");
    println!("{:<14} {:<12} {:>7} {:>9}", "-----", "------", "-------", "----");
    for stage in &view.stages {
        println!(
            "{:<14} {:<12} {:>7} {:>9.4}",
            stage.stage.as_str(),
            styled_stage_status(stage.status),
            stage.retry_count,
            stage.cost
        );
        if let Some(error) = &stage.error_message {
            println!("    {}", console::style(error).dim());
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_list(config: &SysrevConfig, json: bool) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let runs = orchestrator.store().list_runs().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs. Submit one with `sysrev submit <run.toml>`.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<14}  {:>9}  Question",
        "Run", "Status", "Stage", "Cost"
    );
    for run in &runs {
        println!(
            "{:<36}  {:<12}  {:<14}  {:>9.4}  {}",
            run.run_id,
            styled_run_status(run.status),
            run.current_stage.map(|s| s.as_str()).unwrap_or("-"),
            run.total_cost,
            run.config.research_question
        );
    }
    Ok(())
}

pub async fn cmd_checkpoints(config: &SysrevConfig, run_id: &str, json: bool) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let store = orchestrator.store();
    // Fails with RunNotFound for unknown ids.
    store.get_run(run_id).await?;
    let checkpoints = store.list_checkpoints(run_id).await?;
    let ledger = store.cost_ledger(run_id).await?;

    if json {
        let doc = serde_json::json!({ "checkpoints": checkpoints, "cost_ledger": ledger });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    for cp in &checkpoints {
        println!(
            "{:<14} {:<12} retries={} cost={:.4}",
            cp.stage.as_str(),
            styled_stage_status(cp.status),
            cp.retry_count,
            cp.cost
        );
        if let Some(started) = cp.started_at {
            println!("    started:   {}", started.to_rfc3339());
        }
        if let Some(completed) = cp.completed_at {
            println!("    finished:  {}", completed.to_rfc3339());
        }
        if let Some(artifact) = &cp.output_artifact {
            println!("    output:    {}", serde_json::to_string(artifact)?);
        }
        if let Some(error) = &cp.error_message {
            println!("    error:     {}", console::style(error).red());
        }
        if let Some(hint) = &cp.action_hint {
            println!("    hint:      {}", hint);
        }
    }

    if !ledger.is_empty() {
        println!();
        println!("Cost ledger:");
        for entry in &ledger {
            println!(
                "  {}  {:<14} attempt {}  {:.4}",
                entry.recorded_at.to_rfc3339(),
                entry.stage.as_str(),
                entry.attempt,
                entry.amount
            );
        }
    }
    Ok(())
}

/// Reads mirrored snapshots from disk, so it works while another process drives the run.
pub fn cmd_progress(config: &SysrevConfig, run_id: &str, stage: Option<&str>) -> Result<()> {
    let sink = MemoryProgressSink::with_persistence(config.progress_dir());
    let snapshots: Vec<ProgressSnapshot> = match stage {
        Some(name) => {
            let stage: StageName = name
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Unknown stage '{}'", name))?;
            sink.get(run_id, stage).into_iter().collect()
        }
        None => sink.list(run_id),
    };

    if snapshots.is_empty() {
        println!("No progress recorded for run {}.", run_id);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}
