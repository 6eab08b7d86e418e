use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::model::*;
use super::CheckpointStore;
use crate::artifact::Artifact;
use crate::errors::StoreError;
use crate::run_config::RunConfig;
use crate::stage::StageName;

/// Async-safe handle to the checkpoint database.
///
/// Wraps `CheckpointDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CheckpointDb>>,
}

impl DbHandle {
    pub fn new(db: CheckpointDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with exclusive access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut CheckpointDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow!("DB task panicked: {}", e)))?
    }
}

pub struct CheckpointDb {
    conn: Connection,
}

const CHECKPOINT_COLUMNS: &str = "c.run_id, c.stage, c.status, c.started_at, c.completed_at, c.retry_count,
     c.output_artifact, c.error_message, c.action_hint,
     COALESCE((SELECT SUM(l.amount) FROM cost_ledger l WHERE l.run_id = c.run_id AND l.stage = c.stage), 0.0)";

const RUN_COLUMNS: &str = "r.run_id, r.config, r.config_hash, r.current_stage, r.status, r.action_hint,
     r.lease_owner, r.lease_expires_at, r.created_at, r.updated_at, r.completed_at,
     COALESCE((SELECT SUM(l.amount) FROM cost_ledger l WHERE l.run_id = r.run_id), 0.0)";

impl CheckpointDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    config TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    current_stage TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    action_hint TEXT,
                    lease_owner TEXT,
                    lease_expires_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS stage_checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    completed_at TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    output_artifact TEXT,
                    error_message TEXT,
                    action_hint TEXT,
                    UNIQUE(run_id, stage)
                );

                CREATE TABLE IF NOT EXISTS cost_ledger (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    amount REAL NOT NULL,
                    recorded_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON stage_checkpoints(run_id);
                CREATE INDEX IF NOT EXISTS idx_ledger_run_stage ON cost_ledger(run_id, stage);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn insert_run(&mut self, run: &Run) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (run_id, config, config_hash, current_stage, status, action_hint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.run_id,
                serde_json::to_string(&run.config)?,
                run.config_hash,
                run.current_stage.map(|s| s.as_str()),
                run.status.as_str(),
                run.action_hint,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        for stage in StageName::ALL {
            tx.execute(
                "INSERT INTO stage_checkpoints (run_id, stage, position) VALUES (?1, ?2, ?3)",
                params![run.run_id, stage.as_str(), stage.position() as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.find_run(run_id)?.ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    fn find_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let sql = format!("SELECT {} FROM runs r WHERE r.run_id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![run_id], RunRow::from_row)
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let sql = format!("SELECT {} FROM runs r ORDER BY r.rowid ASC", RUN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], RunRow::from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    pub fn delete_run(&mut self, run_id: &str) -> Result<(), StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        if deleted == 0 {
            return Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    /// Read-modify-write a run inside an immediate transaction.
    fn mutate_run<T>(
        &mut self,
        run_id: &str,
        f: impl FnOnce(&mut Run, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<(Run, T), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!("SELECT {} FROM runs r WHERE r.run_id = ?1", RUN_COLUMNS);
        let mut run = tx
            .query_row(&sql, params![run_id], RunRow::from_row)
            .optional()?
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?
            .into_run()?;

        let out = f(&mut run, Utc::now())?;

        tx.execute(
            "UPDATE runs SET current_stage = ?1, status = ?2, action_hint = ?3, lease_owner = ?4,
                    lease_expires_at = ?5, updated_at = ?6, completed_at = ?7
             WHERE run_id = ?8",
            params![
                run.current_stage.map(|s| s.as_str()),
                run.status.as_str(),
                run.action_hint,
                run.lease.as_ref().map(|l| l.owner.clone()),
                run.lease.as_ref().map(|l| l.expires_at.to_rfc3339()),
                run.updated_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
                run_id,
            ],
        )?;
        tx.commit()?;
        Ok((run, out))
    }

    pub fn update_run(&mut self, run_id: &str, update: &RunUpdate) -> Result<Run, StoreError> {
        let (run, ()) = self.mutate_run(run_id, |run, now| run.apply(update, now))?;
        Ok(run)
    }

    pub fn acquire_lease(
        &mut self,
        run_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<RunLease, StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Database(anyhow!("Invalid lease TTL: {}", e)))?;
        let (_, lease) = self.mutate_run(run_id, |run, now| run.claim_lease(owner, now + ttl, now))?;
        Ok(lease)
    }

    pub fn release_lease(&mut self, run_id: &str, owner: &str) -> Result<(), StoreError> {
        self.mutate_run(run_id, |run, _| {
            if run.lease.as_ref().is_some_and(|l| l.owner == owner) {
                run.lease = None;
            }
            Ok(())
        })?;
        Ok(())
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    pub fn get_checkpoint(&self, run_id: &str, stage: StageName) -> Result<StageCheckpoint, StoreError> {
        Self::read_checkpoint(&self.conn, run_id, stage)
    }

    fn read_checkpoint(
        conn: &Connection,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, StoreError> {
        let sql = format!(
            "SELECT {} FROM stage_checkpoints c WHERE c.run_id = ?1 AND c.stage = ?2",
            CHECKPOINT_COLUMNS
        );
        conn.query_row(&sql, params![run_id, stage.as_str()], CheckpointRow::from_row)
            .optional()?
            .ok_or_else(|| StoreError::CheckpointNotFound {
                run_id: run_id.to_string(),
                stage,
            })?
            .into_checkpoint()
    }

    pub fn list_checkpoints(&self, run_id: &str) -> Result<Vec<StageCheckpoint>, StoreError> {
        let sql = format!(
            "SELECT {} FROM stage_checkpoints c WHERE c.run_id = ?1 ORDER BY c.position ASC",
            CHECKPOINT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id], CheckpointRow::from_row)?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    fn write_checkpoint(conn: &Connection, cp: &StageCheckpoint) -> Result<(), StoreError> {
        let artifact = cp
            .output_artifact
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "UPDATE stage_checkpoints SET status = ?1, started_at = ?2, completed_at = ?3, retry_count = ?4,
                    output_artifact = ?5, error_message = ?6, action_hint = ?7
             WHERE run_id = ?8 AND stage = ?9",
            params![
                cp.status.as_str(),
                cp.started_at.map(|t| t.to_rfc3339()),
                cp.completed_at.map(|t| t.to_rfc3339()),
                cp.retry_count,
                artifact,
                cp.error_message,
                cp.action_hint,
                cp.run_id,
                cp.stage.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn transition(
        &mut self,
        run_id: &str,
        stage: StageName,
        expected: StageStatus,
        update: &CheckpointUpdate,
    ) -> Result<StageCheckpoint, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = Self::read_checkpoint(&tx, run_id, stage)?;
        if current.status != expected {
            return Err(StoreError::StatusConflict {
                run_id: run_id.to_string(),
                stage,
                expected,
                actual: current.status,
            });
        }
        let next = update.apply(&current, Utc::now())?;
        Self::write_checkpoint(&tx, &next)?;
        tx.commit()?;
        Ok(next)
    }

    pub fn reset_stage(&mut self, run_id: &str, stage: StageName) -> Result<StageCheckpoint, StoreError> {
        let tx = self.conn.transaction()?;
        let current = Self::read_checkpoint(&tx, run_id, stage)?;
        let reset = StageCheckpoint {
            cost: current.cost,
            ..StageCheckpoint::pending(run_id, stage)
        };
        Self::write_checkpoint(&tx, &reset)?;
        tx.commit()?;
        Ok(reset)
    }

    // ── Cost ledger ───────────────────────────────────────────────────

    pub fn record_cost(&mut self, entry: &CostLedgerEntry) -> Result<(), StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO cost_ledger (run_id, stage, attempt, amount, recorded_at)
             SELECT ?1, ?2, ?3, ?4, ?5 WHERE EXISTS (SELECT 1 FROM runs WHERE run_id = ?1)",
            params![
                entry.run_id,
                entry.stage.as_str(),
                entry.attempt,
                entry.amount,
                entry.recorded_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::RunNotFound {
                run_id: entry.run_id.clone(),
            });
        }
        Ok(())
    }

    pub fn cost_ledger(&self, run_id: &str) -> Result<Vec<CostLedgerEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, stage, attempt, amount, recorded_at FROM cost_ledger
             WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (run_id, stage, attempt, amount, recorded_at) = row?;
            entries.push(CostLedgerEntry {
                run_id,
                stage: parse_enum(&stage)?,
                attempt,
                amount,
                recorded_at: parse_timestamp(&recorded_at)?,
            });
        }
        Ok(entries)
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, StoreError> {
    s.parse::<T>().map_err(|e| StoreError::Database(anyhow!(e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(anyhow!("Invalid timestamp '{}': {}", s, e)))
}

fn parse_opt_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_timestamp).transpose()
}

/// Intermediate row struct for stage_checkpoints.
struct CheckpointRow {
    run_id: String,
    stage: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    retry_count: u32,
    output_artifact: Option<String>,
    error_message: Option<String>,
    action_hint: Option<String>,
    cost: f64,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            stage: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            retry_count: row.get(5)?,
            output_artifact: row.get(6)?,
            error_message: row.get(7)?,
            action_hint: row.get(8)?,
            cost: row.get(9)?,
        })
    }

    fn into_checkpoint(self) -> Result<StageCheckpoint, StoreError> {
        let output_artifact = self
            .output_artifact
            .as_deref()
            .map(serde_json::from_str::<Artifact>)
            .transpose()?;
        Ok(StageCheckpoint {
            run_id: self.run_id,
            stage: parse_enum(&self.stage)?,
            status: parse_enum(&self.status)?,
            started_at: parse_opt_timestamp(self.started_at)?,
            completed_at: parse_opt_timestamp(self.completed_at)?,
            retry_count: self.retry_count,
            output_artifact,
            error_message: self.error_message,
            action_hint: self.action_hint,
            cost: self.cost,
        })
    }
}

/// Intermediate row struct for runs.
struct RunRow {
    run_id: String,
    config: String,
    config_hash: String,
    current_stage: Option<String>,
    status: String,
    action_hint: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    total_cost: f64,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            config: row.get(1)?,
            config_hash: row.get(2)?,
            current_stage: row.get(3)?,
            status: row.get(4)?,
            action_hint: row.get(5)?,
            lease_owner: row.get(6)?,
            lease_expires_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            completed_at: row.get(10)?,
            total_cost: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        let lease = match (self.lease_owner, self.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(RunLease {
                owner,
                expires_at: parse_timestamp(&expires_at)?,
            }),
            _ => None,
        };
        Ok(Run {
            run_id: self.run_id,
            config: serde_json::from_str::<RunConfig>(&self.config)?,
            config_hash: self.config_hash,
            current_stage: self.current_stage.as_deref().map(parse_enum).transpose()?,
            status: parse_enum(&self.status)?,
            total_cost: self.total_cost,
            action_hint: self.action_hint,
            lease,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            completed_at: parse_opt_timestamp(self.completed_at)?,
        })
    }
}

/// `CheckpointStore` backed by SQLite.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: DbHandle,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            db: DbHandle::new(CheckpointDb::new(path)?),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            db: DbHandle::new(CheckpointDb::new_in_memory()?),
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        self.db
            .call(move |db| {
                db.insert_run(&run)?;
                db.get_run(&run.run_id)
            })
            .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.get_run(&run_id)).await
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        self.db.call(|db| db.list_runs()).await
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.delete_run(&run_id)).await
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.update_run(&run_id, &update)).await
    }

    async fn acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<RunLease, StoreError> {
        let run_id = run_id.to_string();
        let owner = owner.to_string();
        self.db
            .call(move |db| db.acquire_lease(&run_id, &owner, ttl))
            .await
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        let owner = owner.to_string();
        self.db.call(move |db| db.release_lease(&run_id, &owner)).await
    }

    async fn get_checkpoint(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, StoreError> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.get_checkpoint(&run_id, stage)).await
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<StageCheckpoint>, StoreError> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.list_checkpoints(&run_id)).await
    }

    async fn transition(
        &self,
        run_id: &str,
        stage: StageName,
        expected: StageStatus,
        update: CheckpointUpdate,
    ) -> Result<StageCheckpoint, StoreError> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.transition(&run_id, stage, expected, &update))
            .await
    }

    async fn reset_stage(
        &self,
        run_id: &str,
        stage: StageName,
    ) -> Result<StageCheckpoint, StoreError> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.reset_stage(&run_id, stage)).await
    }

    async fn record_cost(&self, entry: CostLedgerEntry) -> Result<(), StoreError> {
        self.db.call(move |db| db.record_cost(&entry)).await
    }

    async fn cost_ledger(&self, run_id: &str) -> Result<Vec<CostLedgerEntry>, StoreError> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.cost_ledger(&run_id)).await
    }
}
