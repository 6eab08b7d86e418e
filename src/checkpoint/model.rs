use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::errors::StoreError;
use crate::run_config::RunConfig;
use crate::stage::StageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    NeedsAction,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::NeedsAction => "needs_action",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether an orchestrator may pick this run up.
    pub fn is_drivable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::NeedsAction)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "needs_action" => Ok(Self::NeedsAction),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Status of one stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Position in the partial order PENDING < IN_PROGRESS < terminal.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed | Self::Skipped => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// COMPLETED or SKIPPED: later stages may rely on it.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Transitions a checkpoint may take through `CheckpointStore::transition`.
    ///
    /// IN_PROGRESS -> IN_PROGRESS records retry bookkeeping. FAILED ->
    /// IN_PROGRESS is the single way back, taken when an operator resumes a
    /// blocked run; COMPLETED and SKIPPED are absorbing.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, InProgress)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid stage status: {}", s)),
        }
    }
}

/// Exclusive claim an orchestrator instance holds on a run while driving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub config: RunConfig,
    pub config_hash: String,
    pub current_stage: Option<StageName>,
    pub status: RunStatus,
    /// Sum of the cost ledger; never decreases.
    pub total_cost: f64,
    /// Human-readable hint when the run is blocked or was cancelled.
    pub action_hint: Option<String>,
    pub lease: Option<RunLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(config: RunConfig) -> anyhow::Result<Self> {
        let now = Utc::now();
        Ok(Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            config_hash: config.hash()?,
            config,
            current_stage: None,
            status: RunStatus::Pending,
            total_cost: 0.0,
            action_hint: None,
            lease: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// Apply a lease claim for `owner`; fails if someone else holds a live lease.
    pub(crate) fn claim_lease(
        &mut self,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RunLease, StoreError> {
        if let Some(lease) = &self.lease
            && lease.owner != owner
            && lease.is_live(now)
        {
            return Err(StoreError::LeaseHeld {
                run_id: self.run_id.clone(),
                owner: lease.owner.clone(),
            });
        }
        let lease = RunLease {
            owner: owner.to_string(),
            expires_at,
        };
        self.lease = Some(lease.clone());
        self.updated_at = now;
        Ok(lease)
    }

    pub(crate) fn apply(&mut self, update: &RunUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(expected) = update.expected_status
            && self.status != expected
        {
            return Err(StoreError::RunStatusConflict {
                run_id: self.run_id.clone(),
                expected,
                actual: self.status,
            });
        }
        if let Some(status) = update.status {
            self.status = status;
            self.completed_at = if status == RunStatus::Completed {
                Some(now)
            } else {
                None
            };
        }
        if let Some(stage) = update.current_stage {
            self.current_stage = Some(stage);
        }
        if let Some(hint) = &update.action_hint {
            self.action_hint = hint.clone();
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Patch applied to a run by `CheckpointStore::update_run`.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    /// Reject the update unless the run currently has this status.
    pub expected_status: Option<RunStatus>,
    pub status: Option<RunStatus>,
    pub current_stage: Option<StageName>,
    /// `Some(None)` clears the hint.
    pub action_hint: Option<Option<String>>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn only_if(mut self, expected: RunStatus) -> Self {
        self.expected_status = Some(expected);
        self
    }

    pub fn stage(mut self, stage: StageName) -> Self {
        self.current_stage = Some(stage);
        self
    }

    pub fn hint(mut self, hint: Option<String>) -> Self {
        self.action_hint = Some(hint);
        self
    }
}

/// Durable record of one stage of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub run_id: String,
    pub stage: StageName,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub output_artifact: Option<Artifact>,
    pub error_message: Option<String>,
    pub action_hint: Option<String>,
    /// Sum of this stage's cost ledger entries across all attempts.
    pub cost: f64,
}

impl StageCheckpoint {
    pub fn pending(run_id: &str, stage: StageName) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            output_artifact: None,
            error_message: None,
            action_hint: None,
            cost: 0.0,
        }
    }
}

/// Field patch applied atomically with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointUpdate {
    pub status: StageStatus,
    /// Set `started_at` unless it is already set.
    pub mark_started: bool,
    pub retry_count: Option<u32>,
    pub output_artifact: Option<Artifact>,
    pub error_message: Option<String>,
    pub action_hint: Option<String>,
    /// Drop any previous error and hint before applying this update.
    pub clear_error: bool,
}

impl CheckpointUpdate {
    fn to(status: StageStatus) -> Self {
        Self {
            status,
            mark_started: false,
            retry_count: None,
            output_artifact: None,
            error_message: None,
            action_hint: None,
            clear_error: false,
        }
    }

    /// Begin (or re-enter) execution.
    pub fn start() -> Self {
        Self {
            mark_started: true,
            ..Self::to(StageStatus::InProgress)
        }
    }

    /// Begin a fresh retry budget after an operator-resolved failure.
    pub fn restart() -> Self {
        Self {
            retry_count: Some(0),
            clear_error: true,
            ..Self::start()
        }
    }

    /// Record a retryable failure before sleeping.
    pub fn retrying(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            retry_count: Some(retry_count),
            error_message: Some(error.into()),
            ..Self::to(StageStatus::InProgress)
        }
    }

    pub fn completed(output: Artifact) -> Self {
        Self {
            output_artifact: Some(output),
            clear_error: true,
            ..Self::to(StageStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            action_hint: hint,
            ..Self::to(StageStatus::Failed)
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            action_hint: Some(reason.into()),
            clear_error: true,
            ..Self::to(StageStatus::Skipped)
        }
    }

    /// Validate against the current record and produce the new one.
    pub fn apply(
        &self,
        current: &StageCheckpoint,
        now: DateTime<Utc>,
    ) -> Result<StageCheckpoint, StoreError> {
        if !current.status.can_transition_to(self.status) {
            return Err(StoreError::IllegalTransition {
                from: current.status,
                to: self.status,
            });
        }

        let mut next = current.clone();
        next.status = self.status;
        if self.mark_started && next.started_at.is_none() {
            next.started_at = Some(now);
        }
        next.completed_at = if self.status.is_terminal() { Some(now) } else { None };
        if let Some(retry_count) = self.retry_count {
            next.retry_count = retry_count;
        }
        if self.clear_error {
            next.error_message = None;
            next.action_hint = None;
        }
        if let Some(error) = &self.error_message {
            next.error_message = Some(error.clone());
        }
        if let Some(hint) = &self.action_hint {
            next.action_hint = Some(hint.clone());
        }
        if let Some(artifact) = &self.output_artifact {
            next.output_artifact = Some(artifact.clone());
        }

        if next.status == StageStatus::Completed && next.output_artifact.is_none() {
            return Err(StoreError::InvalidCheckpoint {
                stage: next.stage,
                reason: "a completed checkpoint must carry an output artifact".to_string(),
            });
        }
        Ok(next)
    }
}

/// One attempt's cost. The ledger is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    pub run_id: String,
    pub stage: StageName,
    pub attempt: u32,
    pub amount: f64,
    pub recorded_at: DateTime<Utc>,
}

impl CostLedgerEntry {
    pub fn new(run_id: &str, stage: StageName, attempt: u32, amount: f64) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            attempt,
            amount,
            recorded_at: Utc::now(),
        }
    }
}
