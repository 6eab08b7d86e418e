//! Directory-per-run checkpoint backend.
//!
//! ```text
//! <root>/<run_id>/
//!   run.json          run record (status, lease, config snapshot)
//!   checkpoints.json  one entry per stage, canonical order
//!   ledger.jsonl      append-only cost ledger
//!   .lock             advisory lock held for every read-modify-write
//! ```
//!
//! Documents are replaced by write-then-rename, so a crash leaves either the
//! old or the new version on disk.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::model::*;
use super::{CheckpointStore, stage_cost};
use crate::errors::StoreError;
use crate::stage::StageName;

const RUN_FILE: &str = "run.json";
const CHECKPOINTS_FILE: &str = "checkpoints.json";
const LEDGER_FILE: &str = "ledger.jsonl";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create checkpoint directory: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(RunDir) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(RunDir { root, run_id: String::new() }))
            .await
            .map_err(|e| StoreError::Database(anyhow::anyhow!("checkpoint task panicked: {}", e)))?
    }

    async fn with_run<F, R>(&self, run_id: &str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&RunDir) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let run_id = run_id.to_string();
        self.blocking(move |dir| {
            let dir = dir.for_run(run_id);
            dir.ensure_exists()?;
            let _lock = dir.lock()?;
            f(&dir)
        })
        .await
    }
}

/// Paths and I/O for one run's directory.
struct RunDir {
    root: PathBuf,
    run_id: String,
}

/// Releases the advisory lock on drop.
struct DirLock(fs::File);

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl RunDir {
    fn for_run(self, run_id: String) -> Self {
        Self { root: self.root, run_id }
    }

    fn path(&self) -> PathBuf {
        self.root.join(&self.run_id)
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    fn exists(&self) -> bool {
        self.file(RUN_FILE).exists()
    }

    fn ensure_exists(&self) -> Result<(), StoreError> {
        if self.exists() {
            Ok(())
        } else {
            Err(StoreError::RunNotFound {
                run_id: self.run_id.clone(),
            })
        }
    }

    fn lock(&self) -> Result<DirLock, StoreError> {
        let path = self.file(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| StoreError::Io { path: path.clone(), source })?;
        file.lock_exclusive()
            .map_err(|source| StoreError::Io { path, source })?;
        Ok(DirLock(file))
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.file(name);
        let content =
            fs::read_to_string(&path).map_err(|source| StoreError::Io { path, source })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.file(name);
        let tmp = self.file(&format!("{}.tmp", name));
        let content = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, content).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })?;
        Ok(())
    }

    fn ledger(&self) -> Result<Vec<CostLedgerEntry>, StoreError> {
        let path = self.file(LEDGER_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read_to_string(&path).map_err(|source| StoreError::Io { path, source })?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    fn append_ledger(&self, entry: &CostLedgerEntry) -> Result<(), StoreError> {
        let path = self.file(LEDGER_FILE);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|source| StoreError::Io { path, source })
    }

    fn run(&self) -> Result<Run, StoreError> {
        let mut run: Run = self.read_json(RUN_FILE)?;
        run.total_cost = self.ledger()?.iter().map(|e| e.amount).sum();
        Ok(run)
    }

    fn checkpoints(&self) -> Result<Vec<StageCheckpoint>, StoreError> {
        let mut checkpoints: Vec<StageCheckpoint> = self.read_json(CHECKPOINTS_FILE)?;
        let ledger = self.ledger()?;
        for cp in &mut checkpoints {
            cp.cost = stage_cost(&ledger, cp.stage);
        }
        checkpoints.sort_by_key(|cp| cp.stage.position());
        Ok(checkpoints)
    }

    fn checkpoint(&self, stage: StageName) -> Result<StageCheckpoint, StoreError> {
        self.checkpoints()?
            .into_iter()
            .find(|cp| cp.stage == stage)
            .ok_or_else(|| StoreError::CheckpointNotFound {
                run_id: self.run_id.clone(),
                stage,
            })
    }

    fn replace_checkpoint(&self, next: StageCheckpoint) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints()?;
        for cp in &mut checkpoints {
            if cp.stage == next.stage {
                *cp = next.clone();
            }
        }
        self.write_json(CHECKPOINTS_FILE, &checkpoints)
    }

    fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        self.write_json(RUN_FILE, run)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        self.blocking(move |dir| {
            let dir = dir.for_run(run.run_id.clone());
            let path = dir.path();
            fs::create_dir_all(&path).map_err(|source| StoreError::Io { path, source })?;
            let _lock = dir.lock()?;
            if dir.exists() {
                return Err(StoreError::Database(anyhow::anyhow!(
                    "Run {} already exists",
                    run.run_id
                )));
            }
            let checkpoints: Vec<StageCheckpoint> = StageName::ALL
                .iter()
                .map(|&stage| StageCheckpoint::pending(&run.run_id, stage))
                .collect();
            dir.write_json(CHECKPOINTS_FILE, &checkpoints)?;
            // run.json last: its presence marks the run as created.
            dir.save_run(&run)?;
            dir.run()
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.with_run(run_id, |dir| dir.run()).await
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        self.blocking(|dir| {
            let root = dir.root.clone();
            let entries = fs::read_dir(&root).map_err(|source| StoreError::Io {
                path: root.clone(),
                source,
            })?;
            let mut runs = Vec::new();
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let run_dir = RunDir {
                    root: root.clone(),
                    run_id: entry.file_name().to_string_lossy().to_string(),
                };
                if run_dir.exists() {
                    runs.push(run_dir.run()?);
                }
            }
            runs.sort_by_key(|r| r.created_at);
            Ok(runs)
        })
        .await
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        self.with_run(run_id, |dir| {
            let path = dir.path();
            fs::remove_dir_all(&path).map_err(|source| StoreError::Io { path, source })
        })
        .await
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError> {
        self.with_run(run_id, move |dir| {
            let mut run = dir.run()?;
            run.apply(&update, Utc::now())?;
            dir.save_run(&run)?;
            Ok(run)
        })
        .await
    }

    async fn acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<RunLease, StoreError> {
        let owner = owner.to_string();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Database(anyhow::anyhow!("Invalid lease TTL: {}", e)))?;
        self.with_run(run_id, move |dir| {
            let mut run = dir.run()?;
            let now = Utc::now();
            let lease = run.claim_lease(&owner, now + ttl, now)?;
            dir.save_run(&run)?;
            Ok(lease)
        })
        .await
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), StoreError> {
        let owner = owner.to_string();
        self.with_run(run_id, move |dir| {
            let mut run = dir.run()?;
            if run.lease.as_ref().is_some_and(|l| l.owner == owner) {
                run.lease = None;
                run.updated_at = Utc::now();
                dir.save_run(&run)?;
            }
            Ok(())
        })
        .await
    }

    async fn get_checkpoint(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, StoreError> {
        self.with_run(run_id, move |dir| dir.checkpoint(stage)).await
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<StageCheckpoint>, StoreError> {
        match self.with_run(run_id, |dir| dir.checkpoints()).await {
            Err(StoreError::RunNotFound { .. }) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn transition(
        &self,
        run_id: &str,
        stage: StageName,
        expected: StageStatus,
        update: CheckpointUpdate,
    ) -> Result<StageCheckpoint, StoreError> {
        self.with_run(run_id, move |dir| {
            let current = dir.checkpoint(stage)?;
            if current.status != expected {
                return Err(StoreError::StatusConflict {
                    run_id: dir.run_id.clone(),
                    stage,
                    expected,
                    actual: current.status,
                });
            }
            let next = update.apply(&current, Utc::now())?;
            dir.replace_checkpoint(next.clone())?;
            Ok(next)
        })
        .await
    }

    async fn reset_stage(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, StoreError> {
        self.with_run(run_id, move |dir| {
            let current = dir.checkpoint(stage)?;
            let reset = StageCheckpoint {
                cost: current.cost,
                ..StageCheckpoint::pending(&dir.run_id, stage)
            };
            dir.replace_checkpoint(reset.clone())?;
            Ok(reset)
        })
        .await
    }

    async fn record_cost(&self, entry: CostLedgerEntry) -> Result<(), StoreError> {
        let run_id = entry.run_id.clone();
        self.with_run(&run_id, move |dir| dir.append_ledger(&entry))
            .await
    }

    async fn cost_ledger(&self, run_id: &str) -> Result<Vec<CostLedgerEntry>, StoreError> {
        match self.with_run(run_id, |dir| dir.ledger()).await {
            Err(StoreError::RunNotFound { .. }) => Ok(Vec::new()),
            other => other,
        }
    }
}
