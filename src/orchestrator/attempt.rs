//! One stage, executed under the retry policy.
//!
//! Checkpoint writes for the stage happen only here, in order:
//! enter IN_PROGRESS, zero or more retry records, then exactly one terminal
//! write. Every attempt that reports a cost appends a ledger entry before
//! the checkpoint moves.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::artifact::{Artifact, ArtifactStore, JSON_MEDIA_TYPE};
use crate::checkpoint::{CheckpointStore, CheckpointUpdate, CostLedgerEntry, StageCheckpoint, StageStatus};
use crate::errors::OrchestratorError;
use crate::progress::{ProgressSink, StageProgress};
use crate::retry::{BackoffPolicy, ErrorClass, classify, classify_error};
use crate::run_config::RunConfig;
use crate::stage::{RateLimiter, StageContext, StageContract, StageInput, StageName, StageOutcome};

/// Terminal result of running one stage.
#[derive(Debug, Clone)]
pub enum StageResult {
    Completed(StageCheckpoint),
    Skipped(StageCheckpoint),
    Failed(StageCheckpoint),
}

/// Everything the retry loop needs besides the stage itself.
pub(crate) struct AttemptContext<'a> {
    pub store: &'a dyn CheckpointStore,
    pub artifacts: &'a Arc<dyn ArtifactStore>,
    pub progress: &'a Arc<dyn ProgressSink>,
    pub policy: &'a BackoffPolicy,
    pub limiter: &'a RateLimiter,
    pub max_inline_bytes: usize,
}

/// How a single attempt ended.
enum AttemptEnd {
    Done(StageResult),
    Failed {
        error: String,
        class: ErrorClass,
        hint: Option<String>,
    },
}

impl AttemptContext<'_> {
    /// Drive `stage` from its current checkpoint to a terminal status.
    pub async fn run_stage(
        &self,
        run_id: &str,
        executor: &dyn StageContract,
        config: &Arc<RunConfig>,
        inputs: BTreeMap<StageName, Artifact>,
    ) -> Result<StageResult, OrchestratorError> {
        let stage = executor.name();
        let current = self.store.get_checkpoint(run_id, stage).await?;
        let entered = match current.status {
            StageStatus::Pending | StageStatus::InProgress => {
                self.store
                    .transition(run_id, stage, current.status, CheckpointUpdate::start())
                    .await?
            }
            // Operator resumed after fixing the cause: fresh retry budget.
            StageStatus::Failed => {
                self.store
                    .transition(run_id, stage, StageStatus::Failed, CheckpointUpdate::restart())
                    .await?
            }
            StageStatus::Completed => return Ok(StageResult::Completed(current)),
            StageStatus::Skipped => return Ok(StageResult::Skipped(current)),
        };

        let mut retry_count = entered.retry_count;
        loop {
            let attempt = retry_count + 1;
            self.progress.begin(run_id, stage, attempt);
            info!(run_id, stage = %stage, attempt, "Executing stage");

            let input = StageInput {
                run_id: run_id.to_string(),
                stage,
                attempt,
                config: config.clone(),
                artifacts: inputs.clone(),
                context: StageContext {
                    limiter: self.limiter.clone(),
                    progress: StageProgress::new(self.progress.clone(), run_id, stage),
                    artifacts: self.artifacts.clone(),
                },
            };

            let end = match executor.execute(input).await {
                Ok(outcome) => {
                    self.record_cost(run_id, stage, attempt, outcome.cost).await?;
                    self.finish_outcome(run_id, stage, outcome).await?
                }
                Err(e) => AttemptEnd::Failed {
                    error: format!("{:#}", e),
                    class: classify_error(&e),
                    hint: None,
                },
            };

            let (error, class, hint) = match end {
                AttemptEnd::Done(result) => {
                    self.progress.finalize(run_id, stage);
                    return Ok(result);
                }
                AttemptEnd::Failed { error, class, hint } => (error, class, hint),
            };

            if class == ErrorClass::Fatal {
                warn!(run_id, stage = %stage, attempt, error = %error, "Stage failed with a fatal error");
                let hint = hint.unwrap_or_else(|| {
                    format!(
                        "Stage '{}' failed: {}. Fix the cause, then resume with `sysrev run {}`.",
                        stage, error, run_id
                    )
                });
                let cp = self
                    .store
                    .transition(
                        run_id,
                        stage,
                        StageStatus::InProgress,
                        CheckpointUpdate::failed(error, Some(hint)),
                    )
                    .await?;
                self.progress.finalize(run_id, stage);
                return Ok(StageResult::Failed(cp));
            }

            if !self.policy.can_retry(retry_count) {
                let message = format!(
                    "Stage '{}' failed after {} attempts; last error: {}",
                    stage, attempt, error
                );
                warn!(run_id, stage = %stage, attempts = attempt, error = %error, "Retries exhausted");
                let hint = format!(
                    "Stage '{}' kept failing with a transient error ({}). Resume with `sysrev run {}` once the service recovers.",
                    stage, error, run_id
                );
                let cp = self
                    .store
                    .transition(
                        run_id,
                        stage,
                        StageStatus::InProgress,
                        CheckpointUpdate::failed(message, Some(hint)),
                    )
                    .await?;
                self.progress.finalize(run_id, stage);
                return Ok(StageResult::Failed(cp));
            }

            let delay = self.policy.next_delay(retry_count);
            retry_count += 1;
            self.store
                .transition(
                    run_id,
                    stage,
                    StageStatus::InProgress,
                    CheckpointUpdate::retrying(retry_count, error.clone()),
                )
                .await?;
            warn!(
                run_id,
                stage = %stage,
                attempt,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable stage failure; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn record_cost(
        &self,
        run_id: &str,
        stage: StageName,
        attempt: u32,
        cost: f64,
    ) -> Result<(), OrchestratorError> {
        if cost > 0.0 && cost.is_finite() {
            self.store
                .record_cost(CostLedgerEntry::new(run_id, stage, attempt, cost))
                .await?;
        } else if cost != 0.0 {
            warn!(run_id, stage = %stage, cost, "Ignoring invalid stage cost");
        }
        Ok(())
    }

    /// Turn a returned outcome into either a terminal checkpoint or a failure to classify.
    async fn finish_outcome(
        &self,
        run_id: &str,
        stage: StageName,
        outcome: StageOutcome,
    ) -> Result<AttemptEnd, OrchestratorError> {
        if !outcome.success {
            let error = outcome
                .error
                .unwrap_or_else(|| "stage reported failure without an error message".to_string());
            let class = if outcome.needs_user_action {
                ErrorClass::Fatal
            } else {
                classify(&error)
            };
            return Ok(AttemptEnd::Failed {
                error,
                class,
                hint: outcome.action_hint,
            });
        }

        if outcome.skipped {
            let reason = outcome
                .action_hint
                .unwrap_or_else(|| "stage reported it does not apply".to_string());
            info!(run_id, stage = %stage, reason = %reason, "Stage skipped itself");
            let cp = self
                .store
                .transition(run_id, stage, StageStatus::InProgress, CheckpointUpdate::skipped(reason))
                .await?;
            return Ok(AttemptEnd::Done(StageResult::Skipped(cp)));
        }

        let Some(output) = outcome.output else {
            return Ok(AttemptEnd::Failed {
                error: "stage reported success without an output artifact".to_string(),
                class: ErrorClass::Fatal,
                hint: None,
            });
        };

        let output = match self.spill_if_large(run_id, stage, output).await {
            Ok(output) => output,
            Err(e) => {
                return Ok(AttemptEnd::Failed {
                    error: format!("{:#}", e),
                    class: classify_error(&e),
                    hint: None,
                });
            }
        };

        let cp = self
            .store
            .transition(run_id, stage, StageStatus::InProgress, CheckpointUpdate::completed(output))
            .await?;
        info!(run_id, stage = %stage, retry_count = cp.retry_count, cost = cp.cost, "Stage completed");
        Ok(AttemptEnd::Done(StageResult::Completed(cp)))
    }

    /// Move oversized inline output to the artifact store.
    async fn spill_if_large(
        &self,
        run_id: &str,
        stage: StageName,
        output: Artifact,
    ) -> anyhow::Result<Artifact> {
        let Artifact::Inline { value } = &output else {
            return Ok(output);
        };
        let bytes = serde_json::to_vec(value)?;
        if bytes.len() <= self.max_inline_bytes {
            return Ok(output);
        }
        info!(run_id, stage = %stage, bytes = bytes.len(), "Spilling large inline output to artifact store");
        self.artifacts
            .put(run_id, stage, "output.json", bytes, JSON_MEDIA_TYPE)
            .await
    }
}
