//! Ephemeral per-stage progress for dashboards and `sysrev progress`.
//!
//! Nothing here feeds back into the checkpoint state machine. Snapshots are
//! kept in memory and, when a directory is configured, mirrored to
//! `<dir>/<run_id>/<stage>.json` on a best-effort basis.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::stage::StageName;

/// Number of recent events retained per snapshot.
pub const RECENT_EVENTS_CAPACITY: usize = 25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub stage: StageName,
    pub attempt: u32,
    #[serde(default)]
    pub current_item: Option<String>,
    #[serde(default)]
    pub recent_events: VecDeque<String>,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub eta_secs: Option<u64>,
    /// Stage-specific free-form fields.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub finalized: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(run_id: &str, stage: StageName, attempt: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            attempt,
            current_item: None,
            recent_events: VecDeque::new(),
            counters: BTreeMap::new(),
            eta_secs: None,
            data: serde_json::Map::new(),
            finalized: false,
            updated_at: Utc::now(),
        }
    }

    /// Merge a partial update. Finalized snapshots are left untouched.
    pub fn apply(&mut self, update: &ProgressUpdate) -> bool {
        if self.finalized {
            return false;
        }
        if let Some(item) = &update.current_item {
            self.current_item = Some(item.clone());
        }
        for event in &update.events {
            if self.recent_events.len() == RECENT_EVENTS_CAPACITY {
                self.recent_events.pop_front();
            }
            self.recent_events.push_back(event.clone());
        }
        for (name, by) in &update.counters {
            let counter = self.counters.entry(name.clone()).or_insert(0);
            *counter = counter.saturating_add(*by);
        }
        if update.eta_secs.is_some() {
            self.eta_secs = update.eta_secs;
        }
        for (key, value) in &update.data {
            self.data.insert(key.clone(), value.clone());
        }
        self.updated_at = Utc::now();
        true
    }
}

/// Partial progress state. Counters are increments, everything else overwrites.
///
/// This is also the shape command stages print as `{"progress": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressUpdate {
    pub current_item: Option<String>,
    pub events: Vec<String>,
    pub counters: BTreeMap<String, u64>,
    pub eta_secs: Option<u64>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Write-mostly progress buffer consumed by pollers.
pub trait ProgressSink: Send + Sync {
    /// Start a fresh snapshot for an attempt, replacing any previous one.
    fn begin(&self, run_id: &str, stage: StageName, attempt: u32);

    fn set_stage_data(&self, run_id: &str, stage: StageName, update: ProgressUpdate);

    /// Flush the snapshot once more and freeze it until the next `begin`.
    fn finalize(&self, run_id: &str, stage: StageName);

    fn get(&self, run_id: &str, stage: StageName) -> Option<ProgressSnapshot>;

    /// Snapshots of a run, in canonical stage order.
    fn list(&self, run_id: &str) -> Vec<ProgressSnapshot>;

    /// Forget everything about a run.
    fn clear_run(&self, run_id: &str);
}

/// In-memory sink with optional JSON mirroring.
#[derive(Default)]
pub struct MemoryProgressSink {
    snapshots: DashMap<(String, StageName), ProgressSnapshot>,
    persist_dir: Option<PathBuf>,
}

impl MemoryProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots: DashMap::new(),
            persist_dir: Some(dir.into()),
        }
    }

    fn snapshot_path(dir: &Path, run_id: &str, stage: StageName) -> PathBuf {
        dir.join(run_id).join(format!("{}.json", stage))
    }

    fn persist(&self, snapshot: &ProgressSnapshot) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let path = Self::snapshot_path(dir, &snapshot.run_id, snapshot.stage);
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist progress snapshot");
        }
    }

    fn load_persisted(&self, run_id: &str, stage: StageName) -> Option<ProgressSnapshot> {
        let dir = self.persist_dir.as_ref()?;
        let content = std::fs::read_to_string(Self::snapshot_path(dir, run_id, stage)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl ProgressSink for MemoryProgressSink {
    fn begin(&self, run_id: &str, stage: StageName, attempt: u32) {
        let snapshot = ProgressSnapshot::new(run_id, stage, attempt);
        self.persist(&snapshot);
        self.snapshots.insert((run_id.to_string(), stage), snapshot);
    }

    fn set_stage_data(&self, run_id: &str, stage: StageName, update: ProgressUpdate) {
        let mut entry = self
            .snapshots
            .entry((run_id.to_string(), stage))
            .or_insert_with(|| ProgressSnapshot::new(run_id, stage, 1));
        if entry.apply(&update) {
            let snapshot = entry.clone();
            drop(entry);
            self.persist(&snapshot);
        }
    }

    fn finalize(&self, run_id: &str, stage: StageName) {
        let snapshot = {
            let Some(mut entry) = self.snapshots.get_mut(&(run_id.to_string(), stage)) else {
                return;
            };
            entry.finalized = true;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.persist(&snapshot);
    }

    fn get(&self, run_id: &str, stage: StageName) -> Option<ProgressSnapshot> {
        self.snapshots
            .get(&(run_id.to_string(), stage))
            .map(|s| s.clone())
            .or_else(|| self.load_persisted(run_id, stage))
    }

    fn list(&self, run_id: &str) -> Vec<ProgressSnapshot> {
        StageName::ALL
            .iter()
            .filter_map(|&stage| self.get(run_id, stage))
            .collect()
    }

    fn clear_run(&self, run_id: &str) {
        self.snapshots.retain(|(id, _), _| id != run_id);
        if let Some(dir) = &self.persist_dir {
            let path = dir.join(run_id);
            if path.exists()
                && let Err(e) = std::fs::remove_dir_all(&path)
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove progress snapshots");
            }
        }
    }
}

/// Progress handle bound to one run and stage, handed to a stage body.
#[derive(Clone)]
pub struct StageProgress {
    sink: Arc<dyn ProgressSink>,
    run_id: String,
    stage: StageName,
}

impl StageProgress {
    pub fn new(sink: Arc<dyn ProgressSink>, run_id: &str, stage: StageName) -> Self {
        Self {
            sink,
            run_id: run_id.to_string(),
            stage,
        }
    }

    /// A handle whose updates go to a private in-memory sink.
    pub fn detached(run_id: &str, stage: StageName) -> Self {
        Self::new(Arc::new(MemoryProgressSink::new()), run_id, stage)
    }

    pub fn merge(&self, update: ProgressUpdate) {
        self.sink.set_stage_data(&self.run_id, self.stage, update);
    }

    pub fn push_event(&self, event: impl Into<String>) {
        self.merge(ProgressUpdate {
            events: vec![event.into()],
            ..Default::default()
        });
    }

    pub fn incr(&self, counter: &str, by: u64) {
        self.merge(ProgressUpdate {
            counters: BTreeMap::from([(counter.to_string(), by)]),
            ..Default::default()
        });
    }

    pub fn set_eta(&self, eta: Duration) {
        self.merge(ProgressUpdate {
            eta_secs: Some(eta.as_secs()),
            ..Default::default()
        });
    }

    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        self.sink.get(&self.run_id, self.stage)
    }
}
