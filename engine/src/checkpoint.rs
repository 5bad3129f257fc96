//! Checkpoint/resume for batch deletions.
//!
//! A checkpoint is one JSON snapshot per operation, overwritten in place
//! (write to .tmp, then rename). It is saved every [`SAVE_INTERVAL`]
//! recorded items, removed when the operation completes and left in place
//! when it is interrupted.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regsweep_core::error::{Result, SweepError};
use serde::{Deserialize, Serialize};

use crate::store::ImageKey;

/// Items recorded between two saves.
pub const SAVE_INTERVAL: usize = 10;

const FILE_SUFFIX: &str = ".checkpoint.json";

/// Terminal classification of a processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemMark {
    Completed,
    Failed,
    Skipped,
}

impl ItemMark {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemMark::Completed => "completed",
            ItemMark::Failed => "failed",
            ItemMark::Skipped => "skipped",
        }
    }
}

/// Persisted progress of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub operation_id: String,
    pub operation_type: String,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub total_items: usize,
    pub completed_items: BTreeSet<ImageKey>,
    pub failed_items: BTreeSet<ImageKey>,
    pub skipped_items: BTreeSet<ImageKey>,
}

impl Checkpoint {
    fn new(operation_type: &str, operation_id: String, total_items: usize) -> Self {
        let now = Utc::now();
        Self {
            operation_id,
            operation_type: operation_type.to_string(),
            started_at: now,
            last_updated: now,
            total_items,
            completed_items: BTreeSet::new(),
            failed_items: BTreeSet::new(),
            skipped_items: BTreeSet::new(),
        }
    }

    /// Whether the item already has a terminal classification.
    pub fn contains(&self, key: &ImageKey) -> bool {
        self.completed_items.contains(key)
            || self.failed_items.contains(key)
            || self.skipped_items.contains(key)
    }

    pub fn mark_of(&self, key: &ImageKey) -> Option<ItemMark> {
        if self.completed_items.contains(key) {
            Some(ItemMark::Completed)
        } else if self.failed_items.contains(key) {
            Some(ItemMark::Failed)
        } else if self.skipped_items.contains(key) {
            Some(ItemMark::Skipped)
        } else {
            None
        }
    }

    pub fn processed(&self) -> usize {
        self.completed_items.len() + self.failed_items.len() + self.skipped_items.len()
    }
}

/// New timestamp-derived operation id.
pub fn new_operation_id() -> String {
    Utc::now().format("%Y%m%d-%H%M%S-%3f").to_string()
}

/// Stores checkpoints for one operation type in a directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    operation_type: String,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, operation_type: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            operation_type: operation_type.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, operation_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}{}", self.operation_type, operation_id, FILE_SUFFIX))
    }

    pub fn load(&self, operation_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(operation_id);
        if !path.exists() {
            return Ok(None);
        }
        read_checkpoint(&path).map(Some)
    }

    /// All readable checkpoints, most recently updated first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}-", self.operation_type);
        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }
            match read_checkpoint(&path) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        checkpoints.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(checkpoints)
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Start or resume an operation.
    ///
    /// Resuming with an id requires that checkpoint to exist; resuming
    /// without one picks the most recent checkpoint, or starts fresh if
    /// there is none. A fresh operation refuses to overwrite an existing
    /// checkpoint of the same id.
    pub fn begin(
        &self,
        operation_id: Option<&str>,
        resume: bool,
        total_items: usize,
    ) -> Result<CheckpointSession> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            SweepError::Checkpoint(format!(
                "Failed to create checkpoint directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let existing = match (resume, operation_id) {
            (true, Some(id)) => Some(self.load(id)?.ok_or_else(|| {
                SweepError::Checkpoint(format!("No checkpoint found for operation {}", id))
            })?),
            (true, None) => {
                let latest = self.latest()?;
                if latest.is_none() {
                    tracing::warn!("Resume requested but no checkpoint exists, starting fresh");
                }
                latest
            }
            (false, Some(id)) => {
                if self.path_for(id).exists() {
                    return Err(SweepError::Checkpoint(format!(
                        "Checkpoint for operation {} already exists; resume it instead",
                        id
                    )));
                }
                None
            }
            (false, None) => None,
        };

        let state = match existing {
            Some(mut checkpoint) => {
                tracing::info!(
                    operation_id = %checkpoint.operation_id,
                    processed = checkpoint.processed(),
                    total = checkpoint.total_items,
                    "Resuming from checkpoint"
                );
                checkpoint.total_items = total_items;
                checkpoint
            }
            None => {
                let id = operation_id
                    .map(str::to_string)
                    .unwrap_or_else(new_operation_id);
                tracing::info!(operation_id = %id, total = total_items, "Starting operation");
                Checkpoint::new(&self.operation_type, id, total_items)
            }
        };

        let mut session = CheckpointSession {
            path: self.path_for(&state.operation_id),
            state,
            unsaved: 0,
        };
        session.flush()?;
        Ok(session)
    }
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        SweepError::Checkpoint(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        SweepError::Checkpoint(format!("Malformed checkpoint {}: {}", path.display(), e))
    })
}

/// Live checkpoint for one running operation.
#[derive(Debug)]
pub struct CheckpointSession {
    path: PathBuf,
    state: Checkpoint,
    unsaved: usize,
}

impl CheckpointSession {
    pub fn operation_id(&self) -> &str {
        &self.state.operation_id
    }

    pub fn state(&self) -> &Checkpoint {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Items already classified are not processed again.
    pub fn should_skip(&self, key: &ImageKey) -> bool {
        self.state.contains(key)
    }

    /// Record a terminal classification. Keys never move between sets.
    pub fn record(&mut self, key: &ImageKey, mark: ItemMark) -> Result<()> {
        if self.state.contains(key) {
            return Ok(());
        }
        let set = match mark {
            ItemMark::Completed => &mut self.state.completed_items,
            ItemMark::Failed => &mut self.state.failed_items,
            ItemMark::Skipped => &mut self.state.skipped_items,
        };
        set.insert(key.clone());
        self.unsaved += 1;
        if self.unsaved >= SAVE_INTERVAL {
            self.flush()?;
        }
        Ok(())
    }

    /// Persist the full snapshot now.
    pub fn flush(&mut self) -> Result<()> {
        self.state.last_updated = Utc::now();
        let data = serde_json::to_string_pretty(&self.state)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data)
            .and_then(|_| std::fs::rename(&tmp_path, &self.path))
            .map_err(|e| {
                SweepError::Checkpoint(format!(
                    "Failed to save checkpoint {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        self.unsaved = 0;
        tracing::debug!(
            operation_id = %self.state.operation_id,
            processed = self.state.processed(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Operation finished: drop the checkpoint file.
    pub fn finalize(self) -> Result<Checkpoint> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| {
                SweepError::Checkpoint(format!(
                    "Failed to remove checkpoint {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        }
        tracing::info!(operation_id = %self.state.operation_id, "Operation complete, checkpoint removed");
        Ok(self.state)
    }
}
