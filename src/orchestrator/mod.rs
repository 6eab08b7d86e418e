//! Drives runs through the fixed stage sequence.
//!
//! `RunOrchestrator::drive` is re-entrant: every decision is made from the
//! durable checkpoints, so calling it again after a crash resumes exactly
//! where the last committed write left off. A run lease keeps two
//! orchestrators from driving the same run at once, and the checkpoint
//! compare-and-set catches the race if a lease ever expires mid-stage.

mod attempt;
mod lease;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::artifact::{ArtifactStore, FsArtifactStore};
use crate::checkpoint::{
    CheckpointStore, CheckpointUpdate, Run, RunStatus, RunUpdate, StageCheckpoint, StageStatus,
    open_store,
};
use crate::config::{SysrevConfig, SysrevToml};
use crate::errors::{DataIntegrityError, OrchestratorError, StoreError};
use crate::progress::{MemoryProgressSink, ProgressSink};
use crate::resume::ResumeValidator;
use crate::retry::BackoffPolicy;
use crate::run_config::RunConfig;
use crate::stage::{RateLimiter, StageName, StageRegistry};

pub use attempt::StageResult;
use attempt::AttemptContext;
use lease::LeaseHeartbeat;

/// Hint recorded on a run cancelled by an operator.
pub const CANCELLED_HINT: &str = "Cancelled by operator";

/// How a `drive` call ended. None of these is an error of the orchestrator itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// A stage failed; the run is NEEDS_ACTION and resumable after a fix.
    NeedsAction { stage: StageName, hint: String },
    /// Resumption refused because upstream output cannot be trusted.
    Blocked(DataIntegrityError),
    /// The run was cancelled before the next stage started.
    Cancelled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::NeedsAction { stage, hint } => write!(f, "needs action at {}: {}", stage, hint),
            RunOutcome::Blocked(e) => write!(f, "blocked: {}", e),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub policy: BackoffPolicy,
    pub lease_ttl: Duration,
    pub max_concurrent_runs: usize,
    pub max_inline_artifact_bytes: usize,
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: u32,
    pub max_in_flight: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_toml(&SysrevToml::default())
    }
}

impl OrchestratorSettings {
    pub fn from_toml(toml: &SysrevToml) -> Self {
        let o = &toml.orchestrator;
        Self {
            policy: BackoffPolicy::from_config(&toml.retry),
            lease_ttl: Duration::from_secs(o.lease_ttl_secs),
            max_concurrent_runs: o.max_concurrent_runs.max(1),
            max_inline_artifact_bytes: o.max_inline_artifact_bytes,
            rate_limit_per_sec: o.rate_limit_per_sec,
            rate_limit_burst: o.rate_limit_burst,
            max_in_flight: o.max_in_flight,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Per-stage row of `RunStatusView`.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: StageName,
    pub status: StageStatus,
    pub retry_count: u32,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&StageCheckpoint> for StageSummary {
    fn from(cp: &StageCheckpoint) -> Self {
        Self {
            stage: cp.stage,
            status: cp.status,
            retry_count: cp.retry_count,
            cost: cp.cost,
            error_message: cp.error_message.clone(),
            started_at: cp.started_at,
            completed_at: cp.completed_at,
        }
    }
}

/// Operator-facing view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run_id: String,
    pub research_question: String,
    pub status: RunStatus,
    pub current_stage: Option<StageName>,
    pub total_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leased_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageSummary>,
}

#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<dyn CheckpointStore>,
    registry: StageRegistry,
    artifacts: Arc<dyn ArtifactStore>,
    progress: Arc<dyn ProgressSink>,
    validator: Arc<ResumeValidator>,
    settings: OrchestratorSettings,
    owner: String,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        registry: StageRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        progress: Arc<dyn ProgressSink>,
        settings: OrchestratorSettings,
    ) -> Result<Self, OrchestratorError> {
        registry.validate()?;
        Ok(Self {
            store,
            registry,
            validator: Arc::new(ResumeValidator::new(artifacts.clone())),
            artifacts,
            progress,
            settings,
            owner: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
        })
    }

    /// Wire up stores, stages and settings for a project.
    pub fn from_config(config: &SysrevConfig) -> anyhow::Result<Self> {
        let store = open_store(config)?;
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(config.artifacts_dir()));
        let progress: Arc<dyn ProgressSink> =
            Arc::new(MemoryProgressSink::with_persistence(config.progress_dir()));
        let registry = StageRegistry::from_config(config);
        Ok(Self::new(
            store,
            registry,
            artifacts,
            progress,
            OrchestratorSettings::from_toml(&config.toml),
        )?)
    }

    /// Identity used for run leases.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn progress(&self) -> &Arc<dyn ProgressSink> {
        &self.progress
    }

    /// Persist a new run. Nothing executes until `drive`.
    pub async fn submit(&self, config: RunConfig) -> Result<Run, OrchestratorError> {
        config.validate()?;
        let run = self.store.create_run(Run::new(config)?).await?;
        info!(run_id = %run.run_id, config_hash = %run.config_hash, "Run submitted");
        Ok(run)
    }

    /// Drive a run from its last durable checkpoint until it completes or blocks.
    pub async fn drive(&self, run_id: &str) -> Result<RunOutcome, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        match run.status {
            RunStatus::Completed => return Ok(RunOutcome::Completed),
            RunStatus::Failed => {
                return Err(OrchestratorError::RunNotResumable {
                    run_id: run_id.to_string(),
                    status: run.status,
                });
            }
            RunStatus::Pending | RunStatus::Running | RunStatus::NeedsAction => {}
        }

        self.store
            .acquire_lease(run_id, &self.owner, self.settings.lease_ttl)
            .await?;
        let heartbeat = LeaseHeartbeat::start(
            self.store.clone(),
            run_id.to_string(),
            self.owner.clone(),
            self.settings.lease_ttl,
        );

        let result = self.drive_leased(run).await;

        drop(heartbeat);
        if let Err(e) = self.store.release_lease(run_id, &self.owner).await {
            warn!(run_id, error = %e, "Failed to release run lease");
        }

        match &result {
            Ok(outcome) => info!(run_id, outcome = %outcome, "Drive finished"),
            Err(e) => error!(run_id, error = %e, "Drive aborted"),
        }
        result
    }

    async fn drive_leased(&self, run: Run) -> Result<RunOutcome, OrchestratorError> {
        let run_id = run.run_id.as_str();
        let config = Arc::new(run.config.clone());
        let limiter = RateLimiter::new(
            self.settings.rate_limit_per_sec,
            self.settings.rate_limit_burst,
            self.settings.max_in_flight,
        );
        let attempts = AttemptContext {
            store: self.store.as_ref(),
            artifacts: &self.artifacts,
            progress: &self.progress,
            policy: &self.settings.policy,
            limiter: &limiter,
            max_inline_bytes: self.settings.max_inline_artifact_bytes,
        };

        let start = RunUpdate::status(RunStatus::Running)
            .only_if(run.status)
            .hint(None);
        if let Some(outcome) = self.update_unless_cancelled(run_id, start).await? {
            return Ok(outcome);
        }
        info!(run_id, resumed_from = %run.status, "Driving run");

        loop {
            // Cancellation is checked between stages only.
            let current = self.store.get_run(run_id).await?;
            if current.status == RunStatus::Failed {
                info!(run_id, "Run cancelled; stopping before the next stage");
                return Ok(RunOutcome::Cancelled);
            }

            let checkpoints = self.store.list_checkpoints(run_id).await?;
            let Some(stage) = ResumeValidator::next_stage(&checkpoints) else {
                let done = RunUpdate::status(RunStatus::Completed)
                    .only_if(RunStatus::Running)
                    .hint(None);
                if let Some(outcome) = self.update_unless_cancelled(run_id, done).await? {
                    return Ok(outcome);
                }
                info!(run_id, "Run completed");
                return Ok(RunOutcome::Completed);
            };

            let at_stage = RunUpdate::status(RunStatus::Running)
                .only_if(RunStatus::Running)
                .stage(stage);
            if let Some(outcome) = self.update_unless_cancelled(run_id, at_stage).await? {
                return Ok(outcome);
            }

            if config.skips(stage) {
                self.skip_configured(run_id, stage, &checkpoints).await?;
                continue;
            }

            let Some(executor) = self.registry.get(stage) else {
                let hint = format!(
                    "{}. Configure [stages.{}] in sysrev.toml, then resume the run.",
                    OrchestratorError::UnregisteredStage(stage),
                    stage
                );
                return self.block(run_id, stage, hint).await;
            };

            let inputs = match self
                .validator
                .validate(stage, executor.required_stages(), &checkpoints)
                .await
            {
                Ok(inputs) => inputs,
                Err(integrity) => {
                    error!(run_id, stage = %stage, error = %integrity, "Resume refused");
                    let refused = RunUpdate::status(RunStatus::NeedsAction)
                        .only_if(RunStatus::Running)
                        .stage(stage)
                        .hint(Some(integrity.remedy()));
                    if let Some(outcome) = self.update_unless_cancelled(run_id, refused).await? {
                        return Ok(outcome);
                    }
                    return Ok(RunOutcome::Blocked(integrity));
                }
            };

            match attempts
                .run_stage(run_id, executor.as_ref(), &config, inputs)
                .await?
            {
                StageResult::Completed(_) | StageResult::Skipped(_) => {}
                StageResult::Failed(cp) => {
                    let hint = cp
                        .action_hint
                        .or(cp.error_message)
                        .unwrap_or_else(|| format!("Stage '{}' failed", stage));
                    return self.block(run_id, stage, hint).await;
                }
            }
        }
    }

    /// Apply a guarded run update; a concurrent cancellation yields `Cancelled`.
    async fn update_unless_cancelled(
        &self,
        run_id: &str,
        update: RunUpdate,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        match self.store.update_run(run_id, update).await {
            Ok(_) => Ok(None),
            Err(StoreError::RunStatusConflict {
                actual: RunStatus::Failed,
                ..
            }) => Ok(Some(RunOutcome::Cancelled)),
            Err(e) => Err(e.into()),
        }
    }

    async fn block(
        &self,
        run_id: &str,
        stage: StageName,
        hint: String,
    ) -> Result<RunOutcome, OrchestratorError> {
        let update = RunUpdate::status(RunStatus::NeedsAction)
            .only_if(RunStatus::Running)
            .stage(stage)
            .hint(Some(hint.clone()));
        if let Some(outcome) = self.update_unless_cancelled(run_id, update).await? {
            return Ok(outcome);
        }
        warn!(run_id, stage = %stage, hint = %hint, "Run needs action");
        Ok(RunOutcome::NeedsAction { stage, hint })
    }

    async fn skip_configured(
        &self,
        run_id: &str,
        stage: StageName,
        checkpoints: &[StageCheckpoint],
    ) -> Result<(), OrchestratorError> {
        let status = checkpoints
            .iter()
            .find(|cp| cp.stage == stage)
            .map(|cp| cp.status)
            .unwrap_or(StageStatus::Pending);
        info!(run_id, stage = %stage, "Skipping stage per run configuration");
        self.store
            .transition(
                run_id,
                stage,
                status,
                CheckpointUpdate::skipped("skipped by run configuration"),
            )
            .await?;
        Ok(())
    }

    /// Drive several independent runs, at most `max_concurrent_runs` at a time.
    ///
    /// Results come back in input order; one run's failure never affects another.
    pub async fn drive_many(
        &self,
        run_ids: Vec<String>,
    ) -> Vec<(String, Result<RunOutcome, OrchestratorError>)> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_runs));
        let mut tasks = JoinSet::new();
        for (index, run_id) in run_ids.iter().cloned().enumerate() {
            let orchestrator = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => orchestrator.drive(&run_id).await,
                    Err(e) => Err(OrchestratorError::Other(e.into())),
                };
                (index, result)
            });
        }

        let mut results: BTreeMap<usize, Result<RunOutcome, OrchestratorError>> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    results.insert(index, result);
                }
                Err(e) => error!(error = %e, "Run task panicked"),
            }
        }

        run_ids
            .into_iter()
            .enumerate()
            .map(|(index, run_id)| {
                let result = results.remove(&index).unwrap_or_else(|| {
                    Err(OrchestratorError::Other(anyhow::anyhow!(
                        "drive task for run {} did not finish",
                        run_id
                    )))
                });
                (run_id, result)
            })
            .collect()
    }

    /// Runs an orchestrator could pick up now: not terminal and not leased by someone else.
    pub async fn drivable_runs(&self) -> Result<Vec<String>, OrchestratorError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_runs()
            .await?
            .into_iter()
            .filter(|run| run.status.is_drivable())
            .filter(|run| {
                run.lease
                    .as_ref()
                    .is_none_or(|l| l.owner == self.owner || !l.is_live(now))
            })
            .map(|run| run.run_id)
            .collect())
    }

    /// Mark a run cancelled. A stage already in progress runs to its end.
    pub async fn cancel(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::RunNotResumable {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        let run = self
            .store
            .update_run(
                run_id,
                RunUpdate::status(RunStatus::Failed)
                    .only_if(run.status)
                    .hint(Some(CANCELLED_HINT.to_string())),
            )
            .await?;
        info!(run_id, "Run cancelled");
        Ok(run)
    }

    /// Operator action: return one stage to PENDING so it runs again.
    pub async fn reset_stage(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, OrchestratorError> {
        let run = self.ensure_not_leased(run_id).await?;
        let cp = self.store.reset_stage(run_id, stage).await?;
        if run.status == RunStatus::Completed {
            self.store
                .update_run(
                    run_id,
                    RunUpdate::status(RunStatus::NeedsAction)
                        .stage(stage)
                        .hint(Some(format!("Stage '{}' was reset; resume the run to re-execute it.", stage))),
                )
                .await?;
        }
        info!(run_id, stage = %stage, "Stage reset to pending");

        let stale = self.stale_dependents(run_id, stage).await?;
        if !stale.is_empty() {
            warn!(
                run_id,
                stage = %stage,
                dependents = ?stale,
                "Completed downstream stages still hold output built from the reset stage"
            );
        }
        Ok(cp)
    }

    /// COMPLETED stages that depend on `stage`, directly or through other stages.
    ///
    /// Resetting a stage does not cascade; these keep their outputs until reset too.
    pub async fn stale_dependents(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<Vec<StageName>, OrchestratorError> {
        let checkpoints = self.store.list_checkpoints(run_id).await?;
        let mut affected = vec![stage];
        let mut stale = Vec::new();
        for later in StageName::ALL.into_iter().filter(|s| *s > stage) {
            let required = self
                .registry
                .get(later)
                .map_or(later.required_stages(), |executor| executor.required_stages());
            if !required.iter().any(|r| affected.contains(r)) {
                continue;
            }
            affected.push(later);
            if checkpoints
                .iter()
                .any(|cp| cp.stage == later && cp.status == StageStatus::Completed)
            {
                stale.push(later);
            }
        }
        Ok(stale)
    }

    /// Remove a run with its checkpoints, ledger, artifacts and progress.
    pub async fn delete(&self, run_id: &str) -> Result<(), OrchestratorError> {
        self.ensure_not_leased(run_id).await?;
        self.store.delete_run(run_id).await?;
        if let Err(e) = self.artifacts.delete_run(run_id).await {
            warn!(run_id, error = %format!("{:#}", e), "Failed to remove run artifacts");
        }
        self.progress.clear_run(run_id);
        info!(run_id, "Run deleted");
        Ok(())
    }

    /// Drop another orchestrator's lease, e.g. after it crashed without releasing.
    pub async fn steal_lease(&self, run_id: &str) -> Result<Option<String>, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        let Some(lease) = run.lease else {
            return Ok(None);
        };
        self.store.release_lease(run_id, &lease.owner).await?;
        warn!(run_id, previous_owner = %lease.owner, "Run lease released by force");
        Ok(Some(lease.owner))
    }

    async fn ensure_not_leased(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        if let Some(lease) = &run.lease
            && lease.owner != self.owner
            && lease.is_live(Utc::now())
        {
            return Err(StoreError::LeaseHeld {
                run_id: run_id.to_string(),
                owner: lease.owner.clone(),
            }
            .into());
        }
        Ok(run)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatusView, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        let checkpoints = self.store.list_checkpoints(run_id).await?;
        let now = Utc::now();
        Ok(RunStatusView {
            research_question: run.config.research_question.clone(),
            status: run.status,
            current_stage: run.current_stage,
            total_cost: run.total_cost,
            action_hint: run.action_hint,
            leased_by: run.lease.filter(|l| l.is_live(now)).map(|l| l.owner),
            created_at: run.created_at,
            completed_at: run.completed_at,
            stages: checkpoints.iter().map(StageSummary::from).collect(),
            run_id: run.run_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SqliteCheckpointStore;

    fn orchestrator(store: Arc<dyn CheckpointStore>, settings: OrchestratorSettings) -> RunOrchestrator {
        let dir = std::env::temp_dir().join("sysrev-orchestrator-tests");
        RunOrchestrator::new(
            store,
            StageRegistry::new(),
            Arc::new(FsArtifactStore::new(dir)),
            Arc::new(MemoryProgressSink::new()),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn test_settings_from_toml() {
        let toml = SysrevToml::parse(
            "[retry]\nmax_retries = 5\n\n[orchestrator]\nlease_ttl_secs = 60\nmax_concurrent_runs = 0\n",
        )
        .unwrap();
        let settings = OrchestratorSettings::from_toml(&toml);
        assert_eq!(settings.policy.max_retries, 5);
        assert_eq!(settings.lease_ttl, Duration::from_secs(60));
        assert_eq!(settings.max_concurrent_runs, 1);
        assert_eq!(settings.max_inline_artifact_bytes, 65536);
    }

    #[test]
    fn test_run_outcome_display() {
        let outcome = RunOutcome::NeedsAction {
            stage: StageName::Extract,
            hint: "Set the API key".to_string(),
        };
        assert_eq!(outcome.to_string(), "needs action at extract: Set the API key");
        assert_eq!(RunOutcome::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_new_rejects_invalid_registry() {
        struct Misnamed;

        #[async_trait::async_trait]
        impl crate::stage::StageContract for Misnamed {
            fn name(&self) -> StageName {
                StageName::Screen
            }

            async fn execute(
                &self,
                _input: crate::stage::StageInput,
            ) -> anyhow::Result<crate::stage::StageOutcome> {
                Ok(crate::stage::StageOutcome::skipped("noop"))
            }
        }

        let mut registry = StageRegistry::new();
        registry.insert(StageName::Search, Arc::new(Misnamed));
        let result = RunOrchestrator::new(
            Arc::new(SqliteCheckpointStore::in_memory().unwrap()),
            registry,
            Arc::new(FsArtifactStore::new(std::env::temp_dir())),
            Arc::new(MemoryProgressSink::new()),
            OrchestratorSettings::default(),
        );
        assert!(matches!(result, Err(OrchestratorError::InvalidRegistry(_))));
    }

    #[tokio::test]
    async fn test_cancel_is_rejected_for_finished_runs() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let orch = orchestrator(store.clone(), OrchestratorSettings::default());
        let run = orch.submit(RunConfig::new("Q?")).await.unwrap();

        let cancelled = orch.cancel(&run.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Failed);
        assert_eq!(cancelled.action_hint.as_deref(), Some(CANCELLED_HINT));
        assert!(matches!(
            orch.cancel(&run.run_id).await.unwrap_err(),
            OrchestratorError::RunNotResumable { .. }
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_config() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let orch = orchestrator(store.clone(), OrchestratorSettings::default());
        assert!(orch.submit(RunConfig::new("   ")).await.is_err());
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_steal_lease_without_lease_is_noop() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let orch = orchestrator(store.clone(), OrchestratorSettings::default());
        let run = orch.submit(RunConfig::new("Q?")).await.unwrap();

        assert_eq!(orch.steal_lease(&run.run_id).await.unwrap(), None);

        store
            .acquire_lease(&run.run_id, "crashed-host", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(
            orch.steal_lease(&run.run_id).await.unwrap().as_deref(),
            Some("crashed-host")
        );
        assert!(store.get_run(&run.run_id).await.unwrap().lease.is_none());
    }
}
