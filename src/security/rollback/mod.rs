//! Reversible-operation ledger.
//!
//! Mutating steps are recorded into a pending list as they happen.
//! [`RollbackManager::create_rollback_point`] seals the pending list into a
//! checkpoint that can later be undone, newest operation first.

pub mod storage;

pub use storage::{JsonFileStore, MemoryStore, RollbackStore};

use super::error::{Result, SecurityError};
use crate::config::RollbackConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOperationType {
    FileCreate,
    FileModify,
    FileDelete,
    FileRename,
    FileMove,
    DirectoryCreate,
    DirectoryDelete,
    CommandExecute,
    StateChange,
}

impl RollbackOperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileCreate => "file_create",
            Self::FileModify => "file_modify",
            Self::FileDelete => "file_delete",
            Self::FileRename => "file_rename",
            Self::FileMove => "file_move",
            Self::DirectoryCreate => "directory_create",
            Self::DirectoryDelete => "directory_delete",
            Self::CommandExecute => "command_execute",
            Self::StateChange => "state_change",
        }
    }

    /// Whether an undo exists at all for this kind of operation.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::DirectoryDelete | Self::CommandExecute)
    }
}

impl std::fmt::Display for RollbackOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOperation {
    pub id: String,
    pub op_type: RollbackOperationType,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    /// Source path of a rename or move
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RollbackOperation {
    fn new(op_type: RollbackOperationType, path: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            path: path.into(),
            original_content: None,
            new_content: None,
            original_path: None,
            timestamp: Utc::now(),
            rolled_back: false,
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    /// In recording order
    pub operations: Vec<RollbackOperation>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub operation_id: String,
    pub op_type: RollbackOperationType,
    pub path: PathBuf,
    pub error: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    /// `None` when undoing a pending operation
    pub rollback_point_id: Option<String>,
    pub operations_rolled_back: usize,
    pub failures: Vec<RollbackFailure>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackStats {
    pub total_points: usize,
    pub total_operations: usize,
    pub rolled_back_operations: usize,
    pub pending_operations: usize,
    pub by_type: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Ledger {
    /// Oldest first
    points: Vec<RollbackPoint>,
    pending: Vec<RollbackOperation>,
    /// Points currently being undone
    in_progress: HashSet<String>,
}

pub struct RollbackManager {
    config: RollbackConfig,
    store: Box<dyn RollbackStore>,
    ledger: Mutex<Ledger>,
}

impl Default for RollbackManager {
    fn default() -> Self {
        Self::new(RollbackConfig::default())
    }
}

impl RollbackManager {
    /// In-memory manager; nothing is loaded or persisted.
    pub fn new(config: RollbackConfig) -> Self {
        Self {
            config,
            store: Box::new(MemoryStore::new()),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Manager backed by the configured store, with persisted points loaded.
    pub fn open(config: RollbackConfig) -> Result<Self> {
        let store: Box<dyn RollbackStore> = if config.persist_rollback_points {
            Box::new(JsonFileStore::new(config.storage_dir()))
        } else {
            Box::new(MemoryStore::new())
        };
        Self::with_store(config, store)
    }

    pub fn with_store(config: RollbackConfig, store: Box<dyn RollbackStore>) -> Result<Self> {
        let mut points = store.load_all()?;
        points.sort_by_key(|p| p.timestamp);
        let manager = Self {
            config,
            store,
            ledger: Mutex::new(Ledger {
                points,
                ..Ledger::default()
            }),
        };
        let pruned = {
            let mut ledger = manager.ledger.lock();
            manager.prune(&mut ledger)
        };
        manager.delete_persisted(&pruned);
        tracing::debug!(
            points = manager.ledger.lock().points.len(),
            pruned = pruned.len(),
            "Rollback ledger opened"
        );
        Ok(manager)
    }

    // ── Recording ──

    fn record(&self, operation: RollbackOperation) -> RollbackOperation {
        if self.config.enabled {
            self.ledger.lock().pending.push(operation.clone());
        }
        operation
    }

    pub fn record_file_create(&self, path: impl Into<PathBuf>) -> RollbackOperation {
        self.record(RollbackOperation::new(RollbackOperationType::FileCreate, path))
    }

    pub fn record_file_modify(
        &self,
        path: impl Into<PathBuf>,
        original_content: impl Into<String>,
        new_content: impl Into<String>,
    ) -> RollbackOperation {
        let mut op = RollbackOperation::new(RollbackOperationType::FileModify, path);
        op.original_content = Some(original_content.into());
        op.new_content = Some(new_content.into());
        self.record(op)
    }

    pub fn record_file_delete(
        &self,
        path: impl Into<PathBuf>,
        original_content: impl Into<String>,
    ) -> RollbackOperation {
        let mut op = RollbackOperation::new(RollbackOperationType::FileDelete, path);
        op.original_content = Some(original_content.into());
        self.record(op)
    }

    pub fn record_file_rename(
        &self,
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
    ) -> RollbackOperation {
        let mut op = RollbackOperation::new(RollbackOperationType::FileRename, to);
        op.original_path = Some(from.into());
        self.record(op)
    }

    pub fn record_file_move(&self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> RollbackOperation {
        let mut op = RollbackOperation::new(RollbackOperationType::FileMove, to);
        op.original_path = Some(from.into());
        self.record(op)
    }

    pub fn record_directory_create(&self, path: impl Into<PathBuf>) -> RollbackOperation {
        self.record(RollbackOperation::new(RollbackOperationType::DirectoryCreate, path))
    }

    pub fn record_directory_delete(&self, path: impl Into<PathBuf>) -> RollbackOperation {
        self.record(RollbackOperation::new(RollbackOperationType::DirectoryDelete, path))
    }

    /// `cwd` is stored as the operation path; the command text goes into metadata.
    pub fn record_command_execute(&self, command: &str, cwd: impl Into<PathBuf>) -> RollbackOperation {
        let mut op = RollbackOperation::new(RollbackOperationType::CommandExecute, cwd);
        op.metadata
            .insert("command".into(), Value::String(command.to_string()));
        self.record(op)
    }

    /// Values are stored as JSON text; the caller restores them on rollback.
    pub fn record_state_change(&self, key: &str, previous: &Value, new: &Value) -> RollbackOperation {
        let mut op = RollbackOperation::new(RollbackOperationType::StateChange, key);
        op.original_content = Some(previous.to_string());
        op.new_content = Some(new.to_string());
        self.record(op)
    }

    /// Read the current content of `path` as the pre-state, then record the modification.
    pub fn capture_file_modify(
        &self,
        path: impl AsRef<Path>,
        new_content: impl Into<String>,
    ) -> Result<RollbackOperation> {
        let path = path.as_ref();
        let original = std::fs::read_to_string(path)?;
        Ok(self.record_file_modify(path, original, new_content))
    }

    /// Read the current content of `path` before it is deleted.
    pub fn capture_file_delete(&self, path: impl AsRef<Path>) -> Result<RollbackOperation> {
        let path = path.as_ref();
        let original = std::fs::read_to_string(path)?;
        Ok(self.record_file_delete(path, original))
    }

    pub fn pending_operations(&self) -> Vec<RollbackOperation> {
        self.ledger.lock().pending.clone()
    }

    // ── Checkpoints ──

    /// Seal every pending operation into a new point.
    ///
    /// The point is stored before the ledger changes; if the store fails the
    /// pending operations stay pending and no point is created.
    pub fn create_rollback_point(
        &self,
        description: &str,
        metadata: Map<String, Value>,
    ) -> Result<RollbackPoint> {
        let mut ledger = self.ledger.lock();
        let mut pruned = self.prune(&mut ledger);
        let point = RollbackPoint {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            description: description.to_string(),
            operations: ledger.pending.clone(),
            metadata,
        };
        // Held across the save so no record_* lands between the copy and the clear.
        if let Err(e) = self.store.save(&point) {
            drop(ledger);
            self.delete_persisted(&pruned);
            return Err(e);
        }
        ledger.pending.clear();
        ledger.points.push(point.clone());
        pruned.extend(self.prune_overflow(&mut ledger));
        drop(ledger);

        self.delete_persisted(&pruned);
        tracing::info!(
            id = %point.id,
            operations = point.operations.len(),
            "Rollback point created: {description}"
        );
        Ok(point)
    }

    /// Drop points past their TTL, then enforce the count limit.
    fn prune(&self, ledger: &mut Ledger) -> Vec<String> {
        let ttl = std::time::Duration::from_secs(self.config.rollback_point_ttl_secs);
        let now = Utc::now();
        let mut removed = Vec::new();
        ledger.points.retain(|p| {
            // Timestamps in the future (clock skew) count as fresh
            let keep = now
                .signed_duration_since(p.timestamp)
                .to_std()
                .map_or(true, |age| age <= ttl);
            if !keep {
                removed.push(p.id.clone());
            }
            keep
        });
        removed.extend(self.prune_overflow(ledger));
        removed
    }

    fn prune_overflow(&self, ledger: &mut Ledger) -> Vec<String> {
        let excess = ledger
            .points
            .len()
            .saturating_sub(self.config.max_rollback_points);
        ledger.points.drain(..excess).map(|p| p.id).collect()
    }

    fn delete_persisted(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.store.delete(id) {
                tracing::warn!(id = %id, "Failed to delete pruned rollback point: {e}");
            }
        }
    }

    // ── Undo ──

    /// Undo every not-yet-undone operation of a point, newest first.
    /// Each undo is independent; failures are collected, not propagated.
    /// Persisting the updated flags is best-effort and never changes the result.
    pub fn rollback(&self, id: &str) -> Result<RollbackResult> {
        let operations = {
            let mut ledger = self.ledger.lock();
            let operations = ledger
                .points
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.operations.clone())
                .ok_or_else(|| SecurityError::RollbackPointNotFound(id.to_string()))?;
            if !ledger.in_progress.insert(id.to_string()) {
                return Err(SecurityError::RollbackInProgress(id.to_string()));
            }
            operations
        };

        let started = Instant::now();
        let mut undone = Vec::new();
        let mut failures = Vec::new();
        for op in operations.iter().rev().filter(|op| !op.rolled_back) {
            match undo(op) {
                Ok(()) => undone.push(op.id.clone()),
                Err(e) => {
                    tracing::warn!(operation = %op.id, kind = %op.op_type, "Rollback step failed: {e}");
                    failures.push(failure(op, &e));
                }
            }
        }

        let updated = {
            let mut ledger = self.ledger.lock();
            ledger.in_progress.remove(id);
            ledger.points.iter_mut().find(|p| p.id == id).map(|point| {
                for op in point.operations.iter_mut() {
                    if undone.contains(&op.id) {
                        op.rolled_back = true;
                    }
                }
                point.clone()
            })
        };
        if let Some(point) = updated {
            if let Err(e) = self.store.save(&point) {
                tracing::warn!(id, "Failed to persist rollback state: {e}");
            }
        }

        let result = RollbackResult {
            success: failures.is_empty(),
            rollback_point_id: Some(id.to_string()),
            operations_rolled_back: undone.len(),
            failures,
            duration_ms: elapsed_ms(started),
        };
        tracing::info!(
            id,
            rolled_back = result.operations_rolled_back,
            failed = result.failures.len(),
            "Rollback finished"
        );
        Ok(result)
    }

    /// Undo the most recent pending operation. On failure it stays pending,
    /// in place. The ledger is locked for the single undo.
    pub fn rollback_last_operation(&self) -> Result<Option<RollbackResult>> {
        let mut ledger = self.ledger.lock();
        let Some(op) = ledger.pending.last().cloned() else {
            return Ok(None);
        };
        let started = Instant::now();
        let result = match undo(&op) {
            Ok(()) => {
                ledger.pending.pop();
                RollbackResult {
                    success: true,
                    rollback_point_id: None,
                    operations_rolled_back: 1,
                    failures: Vec::new(),
                    duration_ms: elapsed_ms(started),
                }
            }
            Err(e) => {
                let failed = failure(&op, &e);
                RollbackResult {
                    success: false,
                    rollback_point_id: None,
                    operations_rolled_back: 0,
                    failures: vec![failed],
                    duration_ms: elapsed_ms(started),
                }
            }
        };
        Ok(Some(result))
    }

    // ── Queries ──

    pub fn get_rollback_point(&self, id: &str) -> Option<RollbackPoint> {
        self.ledger.lock().points.iter().find(|p| p.id == id).cloned()
    }

    /// Newest first.
    pub fn list_rollback_points(&self) -> Vec<RollbackPoint> {
        self.ledger.lock().points.iter().rev().cloned().collect()
    }

    pub fn delete_rollback_point(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut ledger = self.ledger.lock();
            let before = ledger.points.len();
            ledger.points.retain(|p| p.id != id);
            ledger.points.len() != before
        };
        if removed {
            self.store.delete(id)?;
        }
        Ok(removed)
    }

    /// Remove every point, persisted files included. Pending operations are kept.
    pub fn clear_rollback_points(&self) -> Result<()> {
        self.ledger.lock().points.clear();
        self.store.clear()
    }

    pub fn get_stats(&self) -> RollbackStats {
        let ledger = self.ledger.lock();
        let mut stats = RollbackStats {
            total_points: ledger.points.len(),
            pending_operations: ledger.pending.len(),
            oldest: ledger.points.first().map(|p| p.timestamp),
            newest: ledger.points.last().map(|p| p.timestamp),
            ..RollbackStats::default()
        };
        for op in ledger.points.iter().flat_map(|p| &p.operations) {
            stats.total_operations += 1;
            if op.rolled_back {
                stats.rolled_back_operations += 1;
            }
            *stats.by_type.entry(op.op_type.to_string()).or_default() += 1;
        }
        stats
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn failure(op: &RollbackOperation, error: &SecurityError) -> RollbackFailure {
    RollbackFailure {
        operation_id: op.id.clone(),
        op_type: op.op_type,
        path: op.path.clone(),
        error: error.to_string(),
        recoverable: op.op_type.is_recoverable(),
    }
}

fn undo(op: &RollbackOperation) -> Result<()> {
    let path = op.path.as_path();
    match op.op_type {
        RollbackOperationType::FileCreate => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        RollbackOperationType::FileModify => {
            let original = pre_state(op)?;
            std::fs::write(path, original)?;
        }
        RollbackOperationType::FileDelete => {
            let original = pre_state(op)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, original)?;
        }
        RollbackOperationType::FileRename | RollbackOperationType::FileMove => {
            let original = op
                .original_path
                .as_deref()
                .ok_or_else(|| SecurityError::MissingPreState(op.id.clone()))?;
            if let Some(parent) = original.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(path, original)?;
        }
        RollbackOperationType::DirectoryCreate => {
            if path.exists() {
                std::fs::remove_dir(path).map_err(|e| SecurityError::RollbackFailed {
                    operation_id: op.id.clone(),
                    message: format!("{} is not empty or not removable: {e}", path.display()),
                })?;
            }
        }
        RollbackOperationType::DirectoryDelete | RollbackOperationType::CommandExecute => {
            return Err(SecurityError::NonRecoverableOperation(op.op_type));
        }
        RollbackOperationType::StateChange => {}
    }
    Ok(())
}

fn pre_state(op: &RollbackOperation) -> Result<&str> {
    op.original_content
        .as_deref()
        .ok_or_else(|| SecurityError::MissingPreState(op.id.clone()))
}
