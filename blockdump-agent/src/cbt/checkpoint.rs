//! Checkpoints for incremental and resumed backups.
//!
//! One record per (VM, disk). `last_success` scopes the next incremental
//! enumeration. `partial` remembers what an unfinished run already persisted
//! so a rerun against the same snapshot skips those extents.

use super::extent::BlockExtent;
use crate::inventory::entity::ManagedRef;
use crate::utils::{path_component, AgentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Last successful backup of a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub snapshot: ManagedRef,
    pub change_id: Option<String>,
    pub capacity_bytes: u64,
    pub operation_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

/// Progress of a run that ended with failures or was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRun {
    /// Snapshot the run was reading from
    pub target: ManagedRef,

    /// Snapshot of the checkpoint the run was incremental against
    pub base: Option<ManagedRef>,

    pub completed: Vec<BlockExtent>,
    pub failed: Vec<BlockExtent>,
    pub updated_at: DateTime<Utc>,
}

impl PartialRun {
    pub fn matches(&self, target: &ManagedRef, base: Option<&ManagedRef>) -> bool {
        &self.target == target && self.base.as_ref() == base
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub vm: ManagedRef,
    pub disk_id: String,
    #[serde(default)]
    pub last_success: Option<Checkpoint>,
    #[serde(default)]
    pub partial: Option<PartialRun>,
}

impl CheckpointRecord {
    pub fn new(vm: ManagedRef, disk_id: impl Into<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            vm,
            disk_id: disk_id.into(),
            last_success: None,
            partial: None,
        }
    }

    /// Extents an earlier run against the same target and base persisted.
    pub fn resumable(&self, target: &ManagedRef, base: Option<&ManagedRef>) -> Option<HashSet<BlockExtent>> {
        self.partial
            .as_ref()
            .filter(|p| p.matches(target, base))
            .map(|p| p.completed.iter().copied().collect())
    }
}

/// Drop extents already persisted by an earlier run. Returns the remaining
/// extents, in order, and how many were skipped.
pub fn apply_resume_filter(
    extents: Vec<BlockExtent>,
    completed: &HashSet<BlockExtent>,
) -> (Vec<BlockExtent>, usize) {
    let before = extents.len();
    let remaining: Vec<BlockExtent> = extents.into_iter().filter(|e| !completed.contains(e)).collect();
    let skipped = before - remaining.len();
    (remaining, skipped)
}

/// Persistence of checkpoint records. The record is opaque to the store.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, vm: &ManagedRef, disk_id: &str) -> Result<Option<CheckpointRecord>>;

    async fn save(&self, record: &CheckpointRecord) -> Result<()>;
}

/// Stores each record as `<root>/<vm>/<disk>.json`.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, vm: &ManagedRef, disk_id: &str) -> PathBuf {
        self.root
            .join(path_component(&vm.value))
            .join(format!("{}.json", path_component(disk_id)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, vm: &ManagedRef, disk_id: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.record_path(vm, disk_id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CheckpointRecord = serde_json::from_slice(&content)?;
        if record.version != CHECKPOINT_VERSION {
            return Err(AgentError::Config(format!(
                "unsupported checkpoint version {} in {}",
                record.version,
                path.display()
            )));
        }
        Ok(Some(record))
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let path = self.record_path(&record.vm, &record.disk_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// In-process store, for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<(ManagedRef, String), CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, vm: &ManagedRef, disk_id: &str) -> Option<CheckpointRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(&(vm.clone(), disk_id.to_string())).cloned()
    }

    pub fn put(&self, record: CheckpointRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert((record.vm.clone(), record.disk_id.clone()), record);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, vm: &ManagedRef, disk_id: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self.get(vm, disk_id))
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        self.put(record.clone());
        Ok(())
    }
}
