//! Typed error hierarchy for the review orchestrator.
//!
//! Three top-level enums cover the three failure domains:
//! - `StoreError` — checkpoint persistence and optimistic-concurrency failures
//! - `DataIntegrityError` — a run cannot be resumed because upstream output is unusable
//! - `OrchestratorError` — infrastructure failures while driving a run
//!
//! Stage execution failures are deliberately absent: they are recorded on the
//! checkpoint and surface as a `RunOutcome`, never as an `Err`.

use thiserror::Error;

use crate::checkpoint::{RunStatus, StageStatus};
use crate::stage::StageName;

/// Errors from a `CheckpointStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("No checkpoint for stage {stage} of run {run_id}")]
    CheckpointNotFound { run_id: String, stage: StageName },

    #[error("Checkpoint {run_id}/{stage} is {actual}, expected {expected}")]
    StatusConflict {
        run_id: String,
        stage: StageName,
        expected: StageStatus,
        actual: StageStatus,
    },

    #[error("Illegal checkpoint transition {from} -> {to}")]
    IllegalTransition { from: StageStatus, to: StageStatus },

    #[error("Invalid checkpoint for stage {stage}: {reason}")]
    InvalidCheckpoint { stage: StageName, reason: String },

    #[error("Run {run_id} is {actual}, expected {expected}")]
    RunStatusConflict {
        run_id: String,
        expected: RunStatus,
        actual: RunStatus,
    },

    #[error("Run {run_id} is leased by orchestrator {owner}")]
    LeaseHeld { run_id: String, owner: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Checkpoint store lock poisoned")]
    LockPoisoned,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint data: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.into())
    }
}

/// A prerequisite's recorded state cannot be trusted, so resumption is refused.
///
/// The fix is always upstream: re-run (or reset) `prerequisite`, not `stage`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataIntegrityError {
    #[error("Stage {stage} requires {prerequisite}, which is {status}")]
    PrerequisiteNotSatisfied {
        stage: StageName,
        prerequisite: StageName,
        status: StageStatus,
    },

    #[error("Stage {stage} requires {prerequisite}, which has never run")]
    PrerequisiteNeverRun {
        stage: StageName,
        prerequisite: StageName,
    },

    #[error("Stage {stage} requires {prerequisite}, which completed without an output artifact")]
    ArtifactMissing {
        stage: StageName,
        prerequisite: StageName,
    },

    #[error("Stage {stage} requires {prerequisite}, whose output artifact cannot be loaded: {reason}")]
    ArtifactUnreadable {
        stage: StageName,
        prerequisite: StageName,
        reason: String,
    },
}

impl DataIntegrityError {
    /// The upstream stage that needs attention.
    pub fn prerequisite(&self) -> StageName {
        match self {
            Self::PrerequisiteNotSatisfied { prerequisite, .. }
            | Self::PrerequisiteNeverRun { prerequisite, .. }
            | Self::ArtifactMissing { prerequisite, .. }
            | Self::ArtifactUnreadable { prerequisite, .. } => *prerequisite,
        }
    }

    /// The stage whose resumption was refused.
    pub fn stage(&self) -> StageName {
        match self {
            Self::PrerequisiteNotSatisfied { stage, .. }
            | Self::PrerequisiteNeverRun { stage, .. }
            | Self::ArtifactMissing { stage, .. }
            | Self::ArtifactUnreadable { stage, .. } => *stage,
        }
    }

    /// Operator-facing remedy.
    pub fn remedy(&self) -> String {
        format!(
            "Output of upstream stage '{}' is unusable ({}). Reset it with `sysrev reset-stage <run> {}` and resume the run.",
            self.prerequisite(),
            self,
            self.prerequisite()
        )
    }
}

/// Errors from driving a run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No executor registered for stage {0}")]
    UnregisteredStage(StageName),

    #[error("Run {run_id} cannot be driven while {status}")]
    RunNotResumable { run_id: String, status: RunStatus },

    #[error("Invalid stage registry: {0}")]
    InvalidRegistry(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
