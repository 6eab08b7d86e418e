//! Decide where a run resumes and whether its upstream outputs can be trusted.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactStore};
use crate::checkpoint::{StageCheckpoint, StageStatus};
use crate::errors::DataIntegrityError;
use crate::stage::StageName;

pub struct ResumeValidator {
    artifacts: Arc<dyn ArtifactStore>,
}

impl ResumeValidator {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }

    /// First stage, in canonical order, that is neither COMPLETED nor SKIPPED.
    ///
    /// `checkpoints` may be in any order; stages with no checkpoint count as
    /// PENDING.
    pub fn next_stage(checkpoints: &[StageCheckpoint]) -> Option<StageName> {
        let by_stage = index(checkpoints);
        StageName::ALL.into_iter().find(|stage| {
            !by_stage
                .get(stage)
                .is_some_and(|cp| cp.status.is_satisfied())
        })
    }

    /// Status-level prerequisite check, without touching artifact storage.
    pub fn check_prerequisites(
        stage: StageName,
        required: &[StageName],
        checkpoints: &[StageCheckpoint],
    ) -> Result<(), DataIntegrityError> {
        let by_stage = index(checkpoints);
        for &prerequisite in required {
            match by_stage.get(&prerequisite) {
                None => {
                    return Err(DataIntegrityError::PrerequisiteNeverRun { stage, prerequisite });
                }
                Some(cp) if cp.status == StageStatus::Pending => {
                    return Err(DataIntegrityError::PrerequisiteNeverRun { stage, prerequisite });
                }
                Some(cp) if !cp.status.is_satisfied() => {
                    return Err(DataIntegrityError::PrerequisiteNotSatisfied {
                        stage,
                        prerequisite,
                        status: cp.status,
                    });
                }
                Some(cp) if cp.status == StageStatus::Completed && cp.output_artifact.is_none() => {
                    return Err(DataIntegrityError::ArtifactMissing { stage, prerequisite });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Full check before `stage` runs: every prerequisite is satisfied and
    /// every COMPLETED prerequisite's artifact re-loads cleanly.
    ///
    /// Returns the verified prerequisite artifacts, keyed by stage.
    pub async fn validate(
        &self,
        stage: StageName,
        required: &[StageName],
        checkpoints: &[StageCheckpoint],
    ) -> Result<BTreeMap<StageName, Artifact>, DataIntegrityError> {
        Self::check_prerequisites(stage, required, checkpoints)?;

        let by_stage = index(checkpoints);
        let mut inputs = BTreeMap::new();
        for &prerequisite in required {
            let Some(artifact) = by_stage
                .get(&prerequisite)
                .and_then(|cp| cp.output_artifact.as_ref())
            else {
                // SKIPPED prerequisites contribute nothing.
                continue;
            };
            if let Err(e) = self.artifacts.verify(artifact).await {
                tracing::warn!(
                    stage = %stage,
                    prerequisite = %prerequisite,
                    error = %format!("{:#}", e),
                    "Prerequisite artifact failed verification"
                );
                return Err(DataIntegrityError::ArtifactUnreadable {
                    stage,
                    prerequisite,
                    reason: format!("{:#}", e),
                });
            }
            inputs.insert(prerequisite, artifact.clone());
        }
        Ok(inputs)
    }
}

fn index(checkpoints: &[StageCheckpoint]) -> BTreeMap<StageName, &StageCheckpoint> {
    checkpoints.iter().map(|cp| (cp.stage, cp)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FsArtifactStore;
    use tempfile::tempdir;

    fn cp(stage: StageName, status: StageStatus) -> StageCheckpoint {
        let mut cp = StageCheckpoint::pending("r1", stage);
        cp.status = status;
        if status == StageStatus::Completed {
            cp.output_artifact = Some(Artifact::inline(serde_json::json!({"stage": stage})));
        }
        cp
    }

    fn all_with(overrides: &[(StageName, StageStatus)]) -> Vec<StageCheckpoint> {
        StageName::ALL
            .iter()
            .map(|&stage| {
                let status = overrides
                    .iter()
                    .find(|(s, _)| *s == stage)
                    .map(|(_, st)| *st)
                    .unwrap_or(StageStatus::Pending);
                cp(stage, status)
            })
            .collect()
    }

    fn validator(dir: &std::path::Path) -> ResumeValidator {
        ResumeValidator::new(Arc::new(FsArtifactStore::new(dir)))
    }

    #[test]
    fn test_next_stage_is_first_unsatisfied() {
        let cps = all_with(&[
            (StageName::Search, StageStatus::Completed),
            (StageName::Screen, StageStatus::Skipped),
        ]);
        assert_eq!(ResumeValidator::next_stage(&cps), Some(StageName::Fetch));
    }

    #[test]
    fn test_next_stage_none_when_all_satisfied() {
        let cps: Vec<_> = StageName::ALL
            .iter()
            .map(|&s| cp(s, StageStatus::Completed))
            .collect();
        assert_eq!(ResumeValidator::next_stage(&cps), None);
    }

    #[test]
    fn test_next_stage_never_passes_a_failed_prerequisite() {
        let cps = all_with(&[
            (StageName::Search, StageStatus::Completed),
            (StageName::Screen, StageStatus::Failed),
        ]);
        assert_eq!(ResumeValidator::next_stage(&cps), Some(StageName::Screen));
    }

    #[test]
    fn test_missing_checkpoints_count_as_pending() {
        let cps = vec![cp(StageName::Search, StageStatus::Completed)];
        assert_eq!(ResumeValidator::next_stage(&cps), Some(StageName::Screen));
        assert_eq!(ResumeValidator::next_stage(&[]), Some(StageName::Search));
    }

    #[test]
    fn test_prerequisite_failed_is_rejected() {
        let cps = all_with(&[(StageName::Search, StageStatus::Failed)]);
        let err = ResumeValidator::check_prerequisites(StageName::Screen, &[StageName::Search], &cps)
            .unwrap_err();
        assert_eq!(
            err,
            DataIntegrityError::PrerequisiteNotSatisfied {
                stage: StageName::Screen,
                prerequisite: StageName::Search,
                status: StageStatus::Failed,
            }
        );
    }

    #[test]
    fn test_prerequisite_never_run_is_rejected() {
        let cps = all_with(&[(StageName::Search, StageStatus::Completed)]);
        let err = ResumeValidator::check_prerequisites(
            StageName::Tables,
            StageName::Tables.required_stages(),
            &cps,
        )
        .unwrap_err();
        assert!(matches!(err, DataIntegrityError::PrerequisiteNeverRun { .. }));
    }

    #[test]
    fn test_completed_without_artifact_is_rejected() {
        let mut cps = all_with(&[(StageName::Search, StageStatus::Completed)]);
        cps[0].output_artifact = None;
        let err = ResumeValidator::check_prerequisites(StageName::Screen, &[StageName::Search], &cps)
            .unwrap_err();
        assert!(matches!(err, DataIntegrityError::ArtifactMissing { .. }));
    }

    #[tokio::test]
    async fn test_validate_returns_verified_inputs() {
        let dir = tempdir().unwrap();
        let cps = all_with(&[
            (StageName::Search, StageStatus::Completed),
            (StageName::Screen, StageStatus::Skipped),
        ]);
        let inputs = validator(dir.path())
            .validate(StageName::Fetch, &[StageName::Search, StageName::Screen], &cps)
            .await
            .unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(inputs.contains_key(&StageName::Search));
    }

    #[tokio::test]
    async fn test_validate_refetches_referenced_artifacts() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let artifact = store
            .put("r1", StageName::Search, "out.json", b"{\"papers\": 42}".to_vec(), crate::artifact::JSON_MEDIA_TYPE)
            .await
            .unwrap();

        let mut cps = all_with(&[(StageName::Search, StageStatus::Completed)]);
        cps[0].output_artifact = Some(artifact);
        let v = validator(dir.path());
        assert!(v.validate(StageName::Screen, &[StageName::Search], &cps).await.is_ok());

        // Deleted upstream output.
        std::fs::remove_dir_all(dir.path().join("r1")).unwrap();
        let err = v
            .validate(StageName::Screen, &[StageName::Search], &cps)
            .await
            .unwrap_err();
        assert!(matches!(err, DataIntegrityError::ArtifactUnreadable { .. }));
        assert_eq!(err.prerequisite(), StageName::Search);
    }

    #[tokio::test]
    async fn test_validate_rejects_present_but_corrupt_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let mut cps = all_with(&[(StageName::Search, StageStatus::Completed)]);
        cps[0].output_artifact = Some(Artifact::Reference {
            uri: format!("file://{}", path.display()),
            sha256: None,
            media_type: Some(crate::artifact::JSON_MEDIA_TYPE.to_string()),
        });
        let err = validator(dir.path())
            .validate(StageName::Screen, &[StageName::Search], &cps)
            .await
            .unwrap_err();
        assert!(matches!(err, DataIntegrityError::ArtifactUnreadable { .. }));
    }
}
