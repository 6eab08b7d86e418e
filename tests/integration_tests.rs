//! Integration tests for the sysrev CLI
//!
//! Stages are implemented by small shell scripts, so the pipeline tests only
//! run on unix.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a sysrev Command
fn sysrev() -> Command {
    let mut cmd = cargo_bin_cmd!("sysrev");
    cmd.env_remove("SYSREV_STORE")
        .env_remove("SYSREV_DB_PATH")
        .env_remove("SYSREV_PROJECT_DIR")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_project(dir: &TempDir) {
    sysrev()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

/// Run config for a review that only executes search and screen.
fn write_run_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("run.toml");
    fs::write(
        &path,
        r#"
research_question = "Does exercise reduce depressive symptoms in adults?"
databases = ["pubmed"]
skip_stages = [
    "fetch", "extract", "risk_of_bias", "analysis", "tables", "figures",
    "introduction", "methods", "results", "discussion", "abstract", "render",
]
"#,
    )
    .unwrap();
    path
}

/// Submit and return the printed run id.
fn submit(dir: &TempDir) -> String {
    let config = write_run_config(dir);
    let output = sysrev()
        .current_dir(dir.path())
        .arg("submit")
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success(), "submit failed: {:?}", output);
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .next()
        .unwrap()
        .trim()
        .to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_sysrev_help() {
        sysrev()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("reset-stage"));
    }

    #[test]
    fn test_sysrev_version() {
        sysrev().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        sysrev()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized sysrev project"));

        assert!(dir.path().join(".sysrev/sysrev.toml").is_file());
        assert!(dir.path().join(".sysrev/artifacts").is_dir());
        assert!(dir.path().join(".sysrev/progress").is_dir());
        assert!(dir.path().join(".sysrev/logs").is_dir());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = create_temp_project();
        init_project(&dir);

        sysrev()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_commands_require_init() {
        let dir = create_temp_project();

        sysrev()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("sysrev init"));
    }

    #[test]
    fn test_list_empty() {
        let dir = create_temp_project();
        init_project(&dir);

        sysrev()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs"));
    }

    #[test]
    fn test_status_unknown_run() {
        let dir = create_temp_project();
        init_project(&dir);

        sysrev()
            .current_dir(dir.path())
            .args(["status", "no-such-run"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults_before_init() {
        let dir = create_temp_project();

        sysrev()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("max_retries = 3"));
    }

    #[test]
    fn test_config_show_reports_env_override() {
        let dir = create_temp_project();
        init_project(&dir);

        sysrev()
            .current_dir(dir.path())
            .env("SYSREV_STORE", "file")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("store backend = \"file\""));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();

        sysrev()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created sysrev.toml"));

        assert!(dir.path().join(".sysrev/sysrev.toml").exists());

        sysrev()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_no_config() {
        let dir = create_temp_project();

        sysrev()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_config_validate_default_is_valid() {
        let dir = create_temp_project();
        init_project(&dir);

        sysrev()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(
            dir.path().join(".sysrev/sysrev.toml"),
            r#"
[orchestrator]
max_concurrent_runs = 0

[stages.sifting]
command = "true"
"#,
        )
        .unwrap();

        sysrev()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrent_runs must be at least 1"))
            .stdout(predicate::str::contains("Unknown stage 'sifting'"));
    }

    #[test]
    fn test_invalid_store_env_is_rejected() {
        let dir = create_temp_project();
        init_project(&dir);

        sysrev()
            .current_dir(dir.path())
            .env("SYSREV_STORE", "postgres")
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("SYSREV_STORE"));
    }
}

// =============================================================================
// Run lifecycle
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_submit_and_list() {
        let dir = create_temp_project();
        init_project(&dir);
        let run_id = submit(&dir);
        assert_eq!(run_id.len(), 36, "unexpected run id: {}", run_id);

        sysrev()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains(run_id.as_str()))
            .stdout(predicate::str::contains("pending"));

        let output = sysrev()
            .current_dir(dir.path())
            .args(["status", &run_id, "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let view: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(view["status"], "pending");
        assert_eq!(view["stages"].as_array().unwrap().len(), 14);
    }

    #[test]
    fn test_submit_rejects_invalid_config() {
        let dir = create_temp_project();
        init_project(&dir);
        let path = dir.path().join("bad.toml");
        fs::write(&path, "research_question = \"  \"\n").unwrap();

        sysrev()
            .current_dir(dir.path())
            .arg("submit")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("research_question must not be empty"));
    }

    #[test]
    fn test_run_without_stage_commands_needs_action() {
        let dir = create_temp_project();
        init_project(&dir);
        let run_id = submit(&dir);

        sysrev()
            .current_dir(dir.path())
            .args(["run", &run_id])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Needs action"))
            .stdout(predicate::str::contains("[stages.search]"));

        let output = sysrev()
            .current_dir(dir.path())
            .args(["status", &run_id, "--json"])
            .output()
            .unwrap();
        let view: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(view["status"], "needs_action");
        assert_eq!(view["current_stage"], "search");
    }

    #[test]
    fn test_cancel_and_delete() {
        let dir = create_temp_project();
        init_project(&dir);
        let run_id = submit(&dir);

        sysrev()
            .current_dir(dir.path())
            .args(["delete", &run_id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));

        sysrev()
            .current_dir(dir.path())
            .args(["cancel", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cancelled"));

        sysrev()
            .current_dir(dir.path())
            .args(["run", &run_id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot be driven"));

        sysrev()
            .current_dir(dir.path())
            .args(["delete", &run_id])
            .assert()
            .success();

        sysrev()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs"));
    }

    #[test]
    fn test_reset_stage_rejects_unknown_stage() {
        let dir = create_temp_project();
        init_project(&dir);
        let run_id = submit(&dir);

        sysrev()
            .current_dir(dir.path())
            .args(["reset-stage", &run_id, "sifting"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid stage name"));
    }

    #[test]
    fn test_file_backend_via_env() {
        let dir = create_temp_project();
        init_project(&dir);
        let config = write_run_config(&dir);

        sysrev()
            .current_dir(dir.path())
            .env("SYSREV_STORE", "file")
            .arg("submit")
            .arg(&config)
            .assert()
            .success();

        assert!(dir.path().join(".sysrev/runs").is_dir());
        assert!(!dir.path().join(".sysrev/sysrev.db").exists());
    }
}

// =============================================================================
// Command-backed pipelines
// =============================================================================

#[cfg(unix)]
mod pipeline {
    use super::*;

    const SEARCH: &str = r#"cat > /dev/null
echo '{"progress": {"current_item": "pubmed", "counters": {"queries": 2}}}'
echo '{"outcome": {"success": true, "output": {"kind": "inline", "value": {"papers": 42}}, "cost": 0.01}}'
"#;

    const SCREEN: &str = r#"input=$(cat)
case "$input" in
  *'"papers":42'*) ;;
  *) echo "search output missing" >&2; exit 1 ;;
esac
echo '{"outcome": {"success": true, "output": {"kind": "inline", "value": {"included": 10}}, "cost": 0.02}}'
"#;

    const SCREEN_FATAL: &str = r#"cat > /dev/null
echo '{"outcome": {"success": false, "error": "missing API key", "needs_user_action": true, "action_hint": "Set SCREEN_API_KEY"}}'
"#;

    fn configure(dir: &TempDir, screen: &str) {
        fs::write(dir.path().join("search.sh"), SEARCH).unwrap();
        fs::write(dir.path().join("screen.sh"), screen).unwrap();
        fs::write(
            dir.path().join(".sysrev/sysrev.toml"),
            r#"
[retry]
base_delay_ms = 0
max_delay_ms = 0

[stages.search]
command = "sh"
args = ["search.sh"]
timeout_secs = 30

[stages.screen]
command = "sh"
args = ["screen.sh"]
timeout_secs = 30
"#,
        )
        .unwrap();
    }

    #[test]
    fn test_pipeline_runs_to_completion() {
        let dir = create_temp_project();
        init_project(&dir);
        configure(&dir, SCREEN);
        let run_id = submit(&dir);

        sysrev()
            .current_dir(dir.path())
            .args(["run", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed"));

        let output = sysrev()
            .current_dir(dir.path())
            .args(["status", &run_id, "--json"])
            .output()
            .unwrap();
        let view: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(view["status"], "completed");
        assert!((view["total_cost"].as_f64().unwrap() - 0.03).abs() < 1e-9);
        assert_eq!(view["stages"][0]["status"], "completed");
        assert_eq!(view["stages"][1]["status"], "completed");
        assert_eq!(view["stages"][2]["status"], "skipped");

        let output = sysrev()
            .current_dir(dir.path())
            .args(["checkpoints", &run_id, "--json"])
            .output()
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(doc["checkpoints"][0]["output_artifact"]["value"]["papers"], 42);
        assert_eq!(doc["cost_ledger"].as_array().unwrap().len(), 2);

        sysrev()
            .current_dir(dir.path())
            .args(["progress", &run_id, "search"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pubmed"))
            .stdout(predicate::str::contains("\"finalized\": true"));
    }

    #[test]
    fn test_pipeline_blocks_then_resumes_after_fix() {
        let dir = create_temp_project();
        init_project(&dir);
        configure(&dir, SCREEN_FATAL);
        let run_id = submit(&dir);

        sysrev()
            .current_dir(dir.path())
            .args(["run", &run_id])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Set SCREEN_API_KEY"));

        sysrev()
            .current_dir(dir.path())
            .args(["status", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("needs_action"))
            .stdout(predicate::str::contains("missing API key"));

        // Operator fixes the stage and resumes.
        fs::write(dir.path().join("screen.sh"), SCREEN).unwrap();
        sysrev()
            .current_dir(dir.path())
            .args(["run", &run_id])
            .assert()
            .success();

        let output = sysrev()
            .current_dir(dir.path())
            .args(["checkpoints", &run_id, "--json"])
            .output()
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        // Search ran exactly once across both invocations.
        let search_entries = doc["cost_ledger"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["stage"] == "search")
            .count();
        assert_eq!(search_entries, 1);
        assert_eq!(doc["checkpoints"][1]["status"], "completed");
        assert_eq!(doc["checkpoints"][1]["retry_count"], 0);
    }

    #[test]
    fn test_run_all_drives_every_run() {
        let dir = create_temp_project();
        init_project(&dir);
        configure(&dir, SCREEN);
        let first = submit(&dir);
        let second = submit(&dir);

        sysrev()
            .current_dir(dir.path())
            .arg("run-all")
            .assert()
            .success()
            .stdout(predicate::str::contains(first.as_str()))
            .stdout(predicate::str::contains(second.as_str()));

        sysrev()
            .current_dir(dir.path())
            .arg("run-all")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs to drive"));
    }

    #[test]
    fn test_submit_with_run_flag() {
        let dir = create_temp_project();
        init_project(&dir);
        configure(&dir, SCREEN);
        let config = write_run_config(&dir);

        sysrev()
            .current_dir(dir.path())
            .arg("submit")
            .arg(&config)
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed"));
    }
}
