//! Durable run and stage-checkpoint state.
//!
//! `CheckpointStore` is the single source of truth for where a run stands.
//! Two backends implement it:
//! - `SqliteCheckpointStore` (default) — one database for all runs
//! - `FileCheckpointStore` — one directory of JSON documents per run
//!
//! Both guarantee that `transition` is an atomic compare-and-set on a
//! checkpoint's status, which is what keeps two orchestrators from executing
//! the same stage after a crash-and-restart race.

pub mod file;
pub mod model;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StoreBackend, SysrevConfig};
use crate::errors::StoreError;
use crate::stage::StageName;

pub use file::FileCheckpointStore;
pub use model::*;
pub use sqlite::SqliteCheckpointStore;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new run together with one PENDING checkpoint per stage.
    async fn create_run(&self, run: Run) -> Result<Run, StoreError>;

    /// Fetch a run; `total_cost` is computed from the ledger.
    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError>;

    /// All runs, oldest first.
    async fn list_runs(&self) -> Result<Vec<Run>, StoreError>;

    /// Remove a run, its checkpoints, and its ledger.
    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError>;

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError>;

    /// Claim or renew the run's lease for `owner`.
    async fn acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<RunLease, StoreError>;

    /// Drop the lease if `owner` still holds it.
    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), StoreError>;

    async fn get_checkpoint(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, StoreError>;

    /// Every checkpoint of a run, in canonical stage order.
    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<StageCheckpoint>, StoreError>;

    /// Atomically move a checkpoint from `expected` to `update.status`.
    ///
    /// Fails with `StatusConflict` when the stored status differs from
    /// `expected`, and with `IllegalTransition` for non-monotonic moves.
    async fn transition(
        &self,
        run_id: &str,
        stage: StageName,
        expected: StageStatus,
        update: CheckpointUpdate,
    ) -> Result<StageCheckpoint, StoreError>;

    /// Operator action: return a checkpoint to PENDING, dropping its output.
    /// The cost ledger is left untouched.
    async fn reset_stage(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, StoreError>;

    async fn record_cost(&self, entry: CostLedgerEntry) -> Result<(), StoreError>;

    async fn cost_ledger(&self, run_id: &str) -> Result<Vec<CostLedgerEntry>, StoreError>;
}

/// Open the backend selected by configuration.
pub fn open_store(config: &SysrevConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match config.store_backend() {
        StoreBackend::Sqlite => Arc::new(SqliteCheckpointStore::open(&config.store_path())?),
        StoreBackend::File => Arc::new(FileCheckpointStore::new(config.store_path())?),
    };
    Ok(store)
}

/// Sum ledger entries per stage, in insertion order.
pub(crate) fn stage_cost(ledger: &[CostLedgerEntry], stage: StageName) -> f64 {
    ledger
        .iter()
        .filter(|e| e.stage == stage)
        .map(|e| e.amount)
        .sum()
}

#[cfg(test)]
pub(crate) mod contract_tests {
    //! Behaviour every backend must share; each backend's tests call these.

    use super::*;
    use crate::artifact::Artifact;
    use crate::run_config::RunConfig;

    pub async fn create_run_seeds_pending_checkpoints(store: &dyn CheckpointStore) {
        let run = store.create_run(Run::new(RunConfig::new("Q?")).unwrap()).await.unwrap();
        let checkpoints = store.list_checkpoints(&run.run_id).await.unwrap();

        assert_eq!(checkpoints.len(), StageName::ALL.len());
        for (cp, stage) in checkpoints.iter().zip(StageName::ALL) {
            assert_eq!(cp.stage, stage);
            assert_eq!(cp.status, StageStatus::Pending);
            assert_eq!(cp.retry_count, 0);
        }
        assert_eq!(store.get_run(&run.run_id).await.unwrap().status, RunStatus::Pending);
    }

    pub async fn transition_is_compare_and_set(store: &dyn CheckpointStore) {
        let run = store.create_run(Run::new(RunConfig::new("Q?")).unwrap()).await.unwrap();
        let id = run.run_id.as_str();

        let cp = store
            .transition(id, StageName::Search, StageStatus::Pending, CheckpointUpdate::start())
            .await
            .unwrap();
        assert_eq!(cp.status, StageStatus::InProgress);
        assert!(cp.started_at.is_some());

        // A second orchestrator racing on the same stage loses.
        let err = store
            .transition(id, StageName::Search, StageStatus::Pending, CheckpointUpdate::start())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));

        let done = store
            .transition(
                id,
                StageName::Search,
                StageStatus::InProgress,
                CheckpointUpdate::completed(Artifact::inline(serde_json::json!({"papers": 42}))),
            )
            .await
            .unwrap();
        assert_eq!(done.status, StageStatus::Completed);
        assert_eq!(done.started_at, cp.started_at);
        assert!(done.completed_at.is_some());

        let reloaded = store.get_checkpoint(id, StageName::Search).await.unwrap();
        assert_eq!(
            reloaded.output_artifact,
            Some(Artifact::inline(serde_json::json!({"papers": 42})))
        );

        let err = store
            .transition(id, StageName::Search, StageStatus::Completed, CheckpointUpdate::start())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    pub async fn cost_is_derived_from_ledger(store: &dyn CheckpointStore) {
        let run = store.create_run(Run::new(RunConfig::new("Q?")).unwrap()).await.unwrap();
        let id = run.run_id.as_str();

        for (attempt, amount) in [(1, 0.01), (2, 0.01), (3, 0.02)] {
            store
                .record_cost(CostLedgerEntry::new(id, StageName::Screen, attempt, amount))
                .await
                .unwrap();
        }
        store
            .record_cost(CostLedgerEntry::new(id, StageName::Search, 1, 0.5))
            .await
            .unwrap();

        let screen = store.get_checkpoint(id, StageName::Screen).await.unwrap();
        assert!((screen.cost - 0.04).abs() < 1e-9);
        let total = store.get_run(id).await.unwrap().total_cost;
        assert!((total - 0.54).abs() < 1e-9);
        assert_eq!(store.cost_ledger(id).await.unwrap().len(), 4);
    }

    pub async fn delete_run_cascades(store: &dyn CheckpointStore) {
        let run = store.create_run(Run::new(RunConfig::new("Q?")).unwrap()).await.unwrap();
        let id = run.run_id.clone();
        store
            .record_cost(CostLedgerEntry::new(&id, StageName::Search, 1, 0.1))
            .await
            .unwrap();

        store.delete_run(&id).await.unwrap();

        assert!(matches!(
            store.get_run(&id).await.unwrap_err(),
            StoreError::RunNotFound { .. }
        ));
        assert!(store.list_checkpoints(&id).await.unwrap().is_empty());
        assert!(store.cost_ledger(&id).await.unwrap().is_empty());
    }

    pub async fn lease_excludes_other_owners(store: &dyn CheckpointStore) {
        let run = store.create_run(Run::new(RunConfig::new("Q?")).unwrap()).await.unwrap();
        let id = run.run_id.as_str();
        let ttl = Duration::from_secs(60);

        store.acquire_lease(id, "a", ttl).await.unwrap();
        store.acquire_lease(id, "a", ttl).await.unwrap();
        assert!(matches!(
            store.acquire_lease(id, "b", ttl).await.unwrap_err(),
            StoreError::LeaseHeld { .. }
        ));

        store.release_lease(id, "a").await.unwrap();
        store.acquire_lease(id, "b", ttl).await.unwrap();
    }

    pub async fn reset_stage_returns_to_pending(store: &dyn CheckpointStore) {
        let run = store.create_run(Run::new(RunConfig::new("Q?")).unwrap()).await.unwrap();
        let id = run.run_id.as_str();
        store
            .transition(id, StageName::Search, StageStatus::Pending, CheckpointUpdate::start())
            .await
            .unwrap();
        store
            .transition(
                id,
                StageName::Search,
                StageStatus::InProgress,
                CheckpointUpdate::completed(Artifact::reference("file:///gone.json")),
            )
            .await
            .unwrap();
        store
            .record_cost(CostLedgerEntry::new(id, StageName::Search, 1, 0.3))
            .await
            .unwrap();

        let cp = store.reset_stage(id, StageName::Search).await.unwrap();
        assert_eq!(cp.status, StageStatus::Pending);
        assert!(cp.output_artifact.is_none());
        assert!(cp.started_at.is_none());
        assert!((cp.cost - 0.3).abs() < 1e-9);
    }

    pub async fn update_run_honours_guard(store: &dyn CheckpointStore) {
        let run = store.create_run(Run::new(RunConfig::new("Q?")).unwrap()).await.unwrap();
        let id = run.run_id.as_str();

        let updated = store
            .update_run(
                id,
                RunUpdate::status(RunStatus::Running)
                    .only_if(RunStatus::Pending)
                    .stage(StageName::Search),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(updated.current_stage, Some(StageName::Search));

        let err = store
            .update_run(id, RunUpdate::status(RunStatus::Running).only_if(RunStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunStatusConflict { .. }));
    }
}
