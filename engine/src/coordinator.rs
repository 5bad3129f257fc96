//! Transactional deletion coordinator.
//!
//! Candidates are processed one at a time in key order. Per candidate:
//! optional backup, image delete, then metadata delete. Metadata is never
//! touched unless the image delete succeeded. The registry delete switch is
//! held by a [`DeleteEnableGuard`] for the whole batch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regsweep_core::config::MetadataConfig;
use regsweep_core::error::{Result, SweepError};
use regsweep_core::identifier::Identifier;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backup::BackupProvider;
use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointSession, ItemMark};
use crate::metadata::{MetadataStore, RecordMatcher};
use crate::selector::{Candidate, Selection};
use crate::store::{ImageKey, ImageStore};

/// Scoped hold on the registry's delete switch.
///
/// Call [`release`](Self::release) to observe errors; otherwise the switch
/// is turned off from a spawned task on drop.
pub struct DeleteEnableGuard {
    store: Arc<dyn ImageStore>,
    released: bool,
}

impl DeleteEnableGuard {
    /// Enable deletes and wait for the registry. On failure the switch is
    /// turned back off before the error is returned.
    pub async fn acquire(store: Arc<dyn ImageStore>) -> Result<Self> {
        let mut guard = Self {
            store,
            released: false,
        };

        let enabled = async {
            guard.store.set_delete_enabled(true).await?;
            guard.store.wait_ready().await
        }
        .await;

        if let Err(e) = enabled {
            tracing::error!(error = %e, "Failed to enable registry deletes");
            if let Err(restore) = guard.do_release().await {
                tracing::error!(error = %restore, "Failed to restore delete switch");
            }
            return Err(match e {
                SweepError::DeleteToggle(_) => e,
                other => SweepError::DeleteToggle(other.to_string()),
            });
        }

        tracing::info!("Registry deletes enabled");
        Ok(guard)
    }

    pub async fn release(mut self) -> Result<()> {
        self.do_release().await
    }

    async fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.store.set_delete_enabled(false).await?;
        self.store.wait_ready().await?;
        self.released = true;
        tracing::info!("Registry deletes disabled");
        Ok(())
    }
}

impl Drop for DeleteEnableGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.set_delete_enabled(false).await {
                        tracing::error!(error = %e, "Failed to disable registry deletes on drop");
                    }
                });
            }
            Err(_) => {
                tracing::error!("Delete switch left enabled: no runtime available to disable it");
            }
        }
    }
}

/// How a run should behave.
#[derive(Debug, Clone, Default)]
pub struct DeletionOptions {
    /// Delete for real instead of reporting
    pub apply: bool,
    /// Operator confirmed (or forced) the deletion
    pub confirmed: bool,
    /// Back up each image before deleting it
    pub backup: bool,
    pub resume: bool,
    pub operation_id: Option<String>,
}

impl DeletionOptions {
    /// Nothing is mutated unless the run is applied and confirmed.
    pub fn is_dry_run(&self) -> bool {
        !(self.apply && self.confirmed)
    }
}

/// Terminal state of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    /// Would be deleted
    DryRun,
    /// Image and (eligible) metadata deleted
    Deleted,
    /// Image deleted but metadata cleanup failed
    MetadataInconsistent,
    /// Image delete failed; metadata untouched
    DeleteFailed,
    /// Image was already gone
    Skipped,
    /// Backup failed, delete not attempted
    BackupAborted,
    /// Classified by an earlier run of this operation
    AlreadyProcessed,
    /// Batch cancelled before reaching this candidate
    NotProcessed,
}

impl OutcomeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeState::DryRun => "dry-run",
            OutcomeState::Deleted => "deleted",
            OutcomeState::MetadataInconsistent => "metadata-inconsistent",
            OutcomeState::DeleteFailed => "delete-failed",
            OutcomeState::Skipped => "skipped",
            OutcomeState::BackupAborted => "backup-aborted",
            OutcomeState::AlreadyProcessed => "already-processed",
            OutcomeState::NotProcessed => "not-processed",
        }
    }
}

/// Per-candidate outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionOutcome {
    pub key: ImageKey,
    pub image_type: String,
    pub identifiers: Vec<Identifier>,
    pub state: OutcomeState,
    pub image_deleted: bool,
    pub metadata_deleted: bool,
    pub metadata_records: u64,
    pub backed_up: bool,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl DeletionOutcome {
    fn new(candidate: &Candidate, state: OutcomeState) -> Self {
        Self {
            key: candidate.key.clone(),
            image_type: candidate.image_type.clone(),
            identifiers: candidate.identifiers.clone(),
            state,
            image_deleted: false,
            metadata_deleted: false,
            metadata_records: 0,
            backed_up: false,
            error: None,
            notes: Vec::new(),
        }
    }
}

/// Aggregate counts for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionSummary {
    pub operation_id: Option<String>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub total_candidates: usize,
    pub deleted: usize,
    pub metadata_inconsistent: usize,
    pub delete_failed: usize,
    pub skipped: usize,
    pub backup_aborted: usize,
    pub already_processed: usize,
    pub not_processed: usize,
    pub estimated_bytes: u64,
    pub realized_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl DeletionSummary {
    fn tally(outcomes: &[DeletionOutcome]) -> Self {
        let mut summary = Self {
            total_candidates: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome.state {
                OutcomeState::DryRun => {}
                OutcomeState::Deleted => summary.deleted += 1,
                OutcomeState::MetadataInconsistent => summary.metadata_inconsistent += 1,
                OutcomeState::DeleteFailed => summary.delete_failed += 1,
                OutcomeState::Skipped => summary.skipped += 1,
                OutcomeState::BackupAborted => summary.backup_aborted += 1,
                OutcomeState::AlreadyProcessed => summary.already_processed += 1,
                OutcomeState::NotProcessed => summary.not_processed += 1,
            }
        }
        summary
    }

    /// Whether anything needs operator attention.
    pub fn has_failures(&self) -> bool {
        self.delete_failed > 0
            || self.metadata_inconsistent > 0
            || self.backup_aborted > 0
            || !self.warnings.is_empty()
    }
}

/// Result of one coordinator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionReport {
    pub generated_at: DateTime<Utc>,
    pub summary: DeletionSummary,
    pub outcomes: Vec<DeletionOutcome>,
    /// Final checkpoint state (removed from disk unless the run was cancelled)
    pub checkpoint: Option<Checkpoint>,
}

/// Drives deletion across the image store and the metadata store.
pub struct DeletionCoordinator {
    store: Arc<dyn ImageStore>,
    metadata: Arc<dyn MetadataStore>,
    collections: MetadataConfig,
    checkpoints: CheckpointManager,
    backup: Option<Arc<dyn BackupProvider>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl DeletionCoordinator {
    pub fn new(
        store: Arc<dyn ImageStore>,
        metadata: Arc<dyn MetadataStore>,
        collections: MetadataConfig,
        checkpoints: CheckpointManager,
    ) -> Self {
        Self {
            store,
            metadata,
            collections,
            checkpoints,
            backup: None,
            cancel: None,
        }
    }

    pub fn with_backup(mut self, backup: Arc<dyn BackupProvider>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Stop between candidates once the receiver reads `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |rx| *rx.borrow())
    }

    pub async fn run(&self, selection: &Selection, options: &DeletionOptions) -> Result<DeletionReport> {
        if options.is_dry_run() {
            return Ok(self.dry_run(selection));
        }
        if options.backup && self.backup.is_none() {
            return Err(SweepError::Config(
                "Backup requested but no backup target is configured".to_string(),
            ));
        }

        let mut session = self.checkpoints.begin(
            options.operation_id.as_deref(),
            options.resume,
            selection.candidates.len(),
        )?;

        // A resumed run re-acquires the switch; it never assumes it is still on.
        let guard = DeleteEnableGuard::acquire(Arc::clone(&self.store)).await?;

        let processed = self.process(selection, options, &mut session).await;
        let released = guard.release().await;

        let (outcomes, cancelled) = match processed {
            Ok(result) => result,
            Err(e) => {
                if let Err(flush) = session.flush() {
                    tracing::error!(error = %flush, "Failed to save checkpoint after batch error");
                }
                if let Err(release) = released {
                    tracing::error!(error = %release, "Failed to disable registry deletes");
                }
                return Err(e);
            }
        };
        let mut summary = DeletionSummary::tally(&outcomes);
        if let Err(e) = released {
            tracing::error!(error = %e, "Failed to disable registry deletes");
            summary
                .warnings
                .push(format!("registry delete switch may still be enabled: {}", e));
        }

        summary.operation_id = Some(session.operation_id().to_string());
        summary.cancelled = cancelled;
        summary.estimated_bytes = selection.freed_bytes;
        summary.realized_bytes = selection.realized_bytes(&session.state().completed_items);

        let checkpoint = if cancelled {
            session.flush()?;
            tracing::warn!(
                operation_id = %session.operation_id(),
                path = %session.path().display(),
                "Operation cancelled, checkpoint kept for resume"
            );
            session.state().clone()
        } else {
            session.finalize()?
        };

        tracing::info!(
            deleted = summary.deleted,
            failed = summary.delete_failed,
            skipped = summary.skipped,
            backup_aborted = summary.backup_aborted,
            metadata_inconsistent = summary.metadata_inconsistent,
            realized_bytes = summary.realized_bytes,
            "Deletion run finished"
        );

        Ok(DeletionReport {
            generated_at: Utc::now(),
            summary,
            outcomes,
            checkpoint: Some(checkpoint),
        })
    }

    fn dry_run(&self, selection: &Selection) -> DeletionReport {
        let outcomes: Vec<DeletionOutcome> = sorted(selection)
            .into_iter()
            .map(|c| DeletionOutcome::new(c, OutcomeState::DryRun))
            .collect();
        let mut summary = DeletionSummary::tally(&outcomes);
        summary.dry_run = true;
        summary.estimated_bytes = selection.freed_bytes;
        tracing::info!(
            candidates = outcomes.len(),
            estimated_bytes = selection.freed_bytes,
            "Dry run, nothing deleted"
        );
        DeletionReport {
            generated_at: Utc::now(),
            summary,
            outcomes,
            checkpoint: None,
        }
    }

    async fn process(
        &self,
        selection: &Selection,
        options: &DeletionOptions,
        session: &mut CheckpointSession,
    ) -> Result<(Vec<DeletionOutcome>, bool)> {
        let candidates = sorted(selection);
        let mut outcomes = Vec::with_capacity(candidates.len());
        let mut cancelled = false;

        for candidate in candidates {
            if cancelled || self.is_cancelled() {
                cancelled = true;
                outcomes.push(DeletionOutcome::new(candidate, OutcomeState::NotProcessed));
                continue;
            }

            if let Some(mark) = session.state().mark_of(&candidate.key) {
                tracing::debug!(image = %candidate.key, ?mark, "Already processed, skipping");
                let mut outcome = DeletionOutcome::new(candidate, OutcomeState::AlreadyProcessed);
                outcome.image_deleted = mark == ItemMark::Completed;
                outcome
                    .notes
                    .push(format!("recorded as {} by an earlier run", mark.as_str()));
                outcomes.push(outcome);
                continue;
            }

            let outcome = self.process_one(selection, candidate, options, session).await?;
            outcomes.push(outcome);
        }

        Ok((outcomes, cancelled))
    }

    async fn process_one(
        &self,
        selection: &Selection,
        candidate: &Candidate,
        options: &DeletionOptions,
        session: &mut CheckpointSession,
    ) -> Result<DeletionOutcome> {
        let key = &candidate.key;
        let mut outcome = DeletionOutcome::new(candidate, OutcomeState::Deleted);

        if options.backup {
            if let Some(backup) = &self.backup {
                if let Err(e) = backup.backup(&key.repository, &key.tag).await {
                    tracing::warn!(image = %key, error = %e, "Backup failed, not deleting");
                    outcome.state = OutcomeState::BackupAborted;
                    outcome.error = Some(e.to_string());
                    outcome
                        .notes
                        .push("recorded as failed; a resumed run will not retry it".to_string());
                    session.record(key, ItemMark::Failed)?;
                    return Ok(outcome);
                }
                outcome.backed_up = true;
            }
        }

        match self.store.delete(&key.repository, &key.tag).await {
            Ok(()) => {
                outcome.image_deleted = true;
                tracing::info!(image = %key, "Image deleted");
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(image = %key, "Image already absent, skipping");
                outcome.state = OutcomeState::Skipped;
                outcome.error = Some(e.to_string());
                session.record(key, ItemMark::Skipped)?;
                return Ok(outcome);
            }
            Err(e) => {
                tracing::error!(image = %key, error = %e, "Image delete failed");
                outcome.state = OutcomeState::DeleteFailed;
                outcome.error = Some(e.to_string());
                session.record(key, ItemMark::Failed)?;
                return Ok(outcome);
            }
        }

        self.cleanup_metadata(selection, candidate, session, &mut outcome)
            .await;
        session.record(key, ItemMark::Completed)?;
        Ok(outcome)
    }

    /// Delete metadata for identifiers no remaining image carries.
    async fn cleanup_metadata(
        &self,
        selection: &Selection,
        candidate: &Candidate,
        session: &CheckpointSession,
        outcome: &mut DeletionOutcome,
    ) {
        let collections = self.collections.collections_for(&candidate.image_type);
        let completed = &session.state().completed_items;
        let mut failures = Vec::new();

        for id in &candidate.matched_identifiers {
            let released = selection.identifier_released(id, |holder| {
                holder == &candidate.key || completed.contains(holder)
            });
            if !released {
                tracing::info!(image = %candidate.key, identifier = %id, "Other images still carry identifier, metadata kept");
                outcome
                    .notes
                    .push(format!("metadata for {} deferred: other images still carry it", id));
                continue;
            }

            match self.delete_metadata(id, collections).await {
                Ok(Some((collection, count))) => {
                    outcome.metadata_records += count;
                    outcome
                        .notes
                        .push(format!("deleted {} record(s) for {} from {}", count, id, collection));
                }
                Ok(None) => {
                    outcome
                        .notes
                        .push(format!("no metadata records found for {}", id));
                }
                Err(e) => {
                    tracing::warn!(image = %candidate.key, identifier = %id, error = %e, "Metadata delete failed after image delete");
                    failures.push(format!("{}: {}", id, e));
                }
            }
        }

        outcome.metadata_deleted = outcome.metadata_records > 0;
        if !failures.is_empty() {
            outcome.state = OutcomeState::MetadataInconsistent;
            outcome.error = Some(failures.join("; "));
        }
    }

    /// Try collections in order; the first one holding the id is cleaned.
    async fn delete_metadata(
        &self,
        id: &Identifier,
        collections: &[String],
    ) -> Result<Option<(String, u64)>> {
        let matcher = RecordMatcher::IdEquals(id.clone());
        for collection in collections {
            let count = self.metadata.delete_records(collection, &matcher).await?;
            if count > 0 {
                tracing::info!(identifier = %id, collection = %collection, count, "Metadata deleted");
                return Ok(Some((collection.clone(), count)));
            }
        }
        Ok(None)
    }
}

fn sorted(selection: &Selection) -> Vec<&Candidate> {
    let mut candidates: Vec<&Candidate> = selection.candidates.iter().collect();
    candidates.sort_by(|a, b| a.key.cmp(&b.key));
    candidates.dedup_by(|a, b| a.key == b.key);
    candidates
}
