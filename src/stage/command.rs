//! Stages implemented by an external program.
//!
//! Protocol:
//! - stdin receives `StageInput::to_wire()` as one JSON document, then EOF
//! - each stdout line `{"progress": {...}}` is merged into the stage's progress
//! - the last stdout line `{"outcome": {...}}` is the `StageOutcome`
//! - other stdout lines are logged at debug level and kept as progress events
//! - a non-zero exit is a raised error carrying stderr
//!
//! The process is killed when the configured timeout elapses.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{StageContract, StageInput, StageName, StageOutcome};
use crate::config::StageCommandConfig;
use crate::progress::ProgressUpdate;

/// Lines a stage program may print on stdout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StageEvent {
    Progress(ProgressUpdate),
    Outcome(StageOutcome),
}

#[derive(Debug, Clone)]
pub struct CommandStage {
    stage: StageName,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    working_dir: PathBuf,
}

impl CommandStage {
    /// Build from a `[stages.<name>]` entry. Relative working directories
    /// resolve against `project_dir`.
    pub fn from_config(stage: StageName, config: &StageCommandConfig, project_dir: &Path) -> Self {
        let working_dir = match &config.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => project_dir.to_path_buf(),
        };
        Self {
            stage,
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            working_dir,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    async fn run(&self, input: StageInput) -> Result<StageOutcome> {
        let payload = serde_json::to_vec(&input.to_wire()).context("Failed to encode stage input")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .env("SYSREV_RUN_ID", &input.run_id)
            .env("SYSREV_STAGE", self.stage.as_str())
            .env("SYSREV_ATTEMPT", input.attempt.to_string())
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn stage command `{}`", self.display()))?;

        tracing::debug!(
            stage = %self.stage,
            pid = child.id().unwrap_or(0),
            command = %self.display(),
            "Stage command spawned"
        );

        let stdin = child.stdin.take().context("Failed to open stage stdin")?;
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            match stdin.write_all(&payload).await {
                // The program may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }?;
            stdin.shutdown().await
        });

        let mut stderr = child.stderr.take().context("Failed to open stage stderr")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let stdout = child.stdout.take().context("Failed to open stage stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut outcome = None;
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<StageEvent>(trimmed) {
                Ok(StageEvent::Progress(update)) => input.context.progress.merge(update),
                Ok(StageEvent::Outcome(o)) => outcome = Some(o),
                Err(_) => {
                    tracing::debug!(stage = %self.stage, line = trimmed, "stage output");
                    input.context.progress.push_event(trimmed);
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for stage command")?;
        let stderr = stderr_task.await.unwrap_or_default();
        if let Ok(Err(e)) = writer.await {
            tracing::debug!(stage = %self.stage, error = %e, "Failed to write stage input");
        }

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            bail!(
                "Stage command `{}` exited with {}: {}",
                self.display(),
                code,
                stderr.trim()
            );
        }

        outcome.with_context(|| {
            format!(
                "Stage command `{}` finished without printing an outcome line",
                self.display()
            )
        })
    }
}

#[async_trait]
impl StageContract for CommandStage {
    fn name(&self) -> StageName {
        self.stage
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutcome> {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run(input)).await {
                Ok(result) => result,
                // Dropping the future drops the child, which kills it.
                Err(_) => bail!(
                    "Stage command `{}` timed out after {}s",
                    self.display(),
                    limit.as_secs_f64()
                ),
            },
            None => self.run(input).await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, FsArtifactStore};
    use crate::progress::{MemoryProgressSink, ProgressSink, StageProgress};
    use crate::retry::{ErrorClass, classify_error};
    use crate::run_config::RunConfig;
    use crate::stage::{RateLimiter, StageContext};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn shell(script: &str, dir: &Path) -> CommandStage {
        CommandStage::from_config(
            StageName::Search,
            &StageCommandConfig {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                ..Default::default()
            },
            dir,
        )
    }

    fn input(sink: Arc<dyn ProgressSink>, dir: &Path) -> StageInput {
        StageInput {
            run_id: "r1".to_string(),
            stage: StageName::Search,
            attempt: 1,
            config: Arc::new(RunConfig::new("Does exercise help?")),
            artifacts: BTreeMap::new(),
            context: StageContext {
                limiter: RateLimiter::unlimited(),
                progress: StageProgress::new(sink, "r1", StageName::Search),
                artifacts: Arc::new(FsArtifactStore::new(dir)),
            },
        }
    }

    #[tokio::test]
    async fn test_outcome_and_progress_lines() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(MemoryProgressSink::new());
        let stage = shell(
            r#"cat > /dev/null
echo '{"progress": {"current_item": "pubmed", "counters": {"queries": 1}}}'
echo 'plain log line'
echo '{"outcome": {"success": true, "output": {"kind": "inline", "value": {"papers": 42}}, "cost": 0.1}}'"#,
            dir.path(),
        );

        let outcome = stage.execute(input(sink.clone(), dir.path())).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, Some(Artifact::inline(serde_json::json!({"papers": 42}))));
        assert_eq!(outcome.cost, 0.1);

        let snapshot = sink.get("r1", StageName::Search).unwrap();
        assert_eq!(snapshot.current_item.as_deref(), Some("pubmed"));
        assert_eq!(snapshot.counters["queries"], 1);
        assert_eq!(snapshot.recent_events, ["plain log line"]);
    }

    #[tokio::test]
    async fn test_stdin_carries_stage_input() {
        let dir = tempdir().unwrap();
        let stage = shell(
            r#"input=$(cat)
printf '{"outcome": {"success": true, "output": {"kind": "inline", "value": %s}}}\n' "$input""#,
            dir.path(),
        );
        let outcome = stage
            .execute(input(Arc::new(MemoryProgressSink::new()), dir.path()))
            .await
            .unwrap();
        let Some(Artifact::Inline { value }) = outcome.output else {
            panic!("expected inline output");
        };
        assert_eq!(value["run_id"], "r1");
        assert_eq!(value["stage"], "search");
        assert_eq!(value["config"]["research_question"], "Does exercise help?");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = tempdir().unwrap();
        let stage = shell("echo 'HTTP 429: rate limit exceeded' >&2; exit 3", dir.path());
        let err = stage
            .execute(input(Arc::new(MemoryProgressSink::new()), dir.path()))
            .await
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("exited with 3"));
        assert!(msg.contains("rate limit exceeded"));
        assert_eq!(classify_error(&err), ErrorClass::Retryable);
    }

    #[tokio::test]
    async fn test_missing_outcome_is_fatal() {
        let dir = tempdir().unwrap();
        let stage = shell("echo hello", dir.path());
        let err = stage
            .execute(input(Arc::new(MemoryProgressSink::new()), dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without printing an outcome"));
        assert_eq!(classify_error(&err), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let dir = tempdir().unwrap();
        let stage = shell("sleep 5", dir.path()).with_timeout(Duration::from_millis(200));
        let err = stage
            .execute(input(Arc::new(MemoryProgressSink::new()), dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(classify_error(&err), ErrorClass::Retryable);
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let dir = tempdir().unwrap();
        let stage = CommandStage::from_config(
            StageName::Search,
            &StageCommandConfig {
                command: "sysrev-definitely-not-installed".to_string(),
                ..Default::default()
            },
            dir.path(),
        );
        let err = stage
            .execute(input(Arc::new(MemoryProgressSink::new()), dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
        assert_eq!(classify_error(&err), ErrorClass::Fatal);
    }
}
