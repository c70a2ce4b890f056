use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::state::{
    MigrationItemKind, MigrationStage, MigrationState, MigrationStateStore, MigrationStatus,
};
use crate::clock;
use crate::model::{EntityType, SyncableEntity};
use crate::storage::{MediaError, StoreError};
use crate::sync::{EngineError, SyncEngine};

pub const AUTHENTICATION_REQUIRED: &str = "authentication_required";
pub const CANCELLED_BY_USER: &str = "cancelled by user";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration storage error: {0}")]
    Store(#[from] StoreError),
    #[error("sync error: {0}")]
    Engine(#[from] EngineError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("a migration run is already in progress")]
    AlreadyRunning,
    #[error("migration already completed")]
    AlreadyCompleted,
    #[error("migration in state {0:?} cannot be resumed")]
    NotResumable(MigrationStatus),
    #[error("no backup of this run is available for rollback")]
    NoBackup,
    #[error("migration cancelled by user")]
    Cancelled,
    #[error("verification failed for {kind:?}: exported {exported}, uploaded {uploaded}")]
    VerificationFailed {
        kind: MigrationItemKind,
        exported: u64,
        uploaded: u64,
    },
}

impl MigrationError {
    /// The run can continue with `resume_migration` once the cause is gone.
    /// Sync failures count only when retrying could succeed, such as a
    /// dropped connection or a blob store that answered 5xx.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MigrationError::AlreadyCompleted | MigrationError::NoBackup => false,
            MigrationError::Engine(err) => err.is_transient(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub deleted_entities: usize,
    pub deleted_media: usize,
    pub failed_deletes: usize,
}

/// Snapshot taken by the export stage of this process's run.
struct MigrationBackup {
    entities: Vec<SyncableEntity>,
    media_before: BTreeSet<String>,
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One-shot upload of the local dataset, resumable stage by stage.
pub struct MigrationOrchestrator {
    engine: Arc<SyncEngine>,
    store: MigrationStateStore,
    state: Mutex<MigrationState>,
    backup: Mutex<Option<MigrationBackup>>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl MigrationOrchestrator {
    pub async fn load(
        engine: Arc<SyncEngine>,
        store: MigrationStateStore,
    ) -> Result<Self, MigrationError> {
        let state = store.load().await?;
        Ok(Self {
            engine,
            store,
            state: Mutex::new(state),
            backup: Mutex::new(None),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    pub async fn state(&self) -> MigrationState {
        self.state.lock().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn has_backup(&self) -> bool {
        self.backup.lock().await.is_some()
    }

    pub async fn start_migration(&self) -> Result<MigrationState, MigrationError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(MigrationError::AlreadyRunning)?;
        if self.state().await.status == MigrationStatus::Completed {
            return Err(MigrationError::AlreadyCompleted);
        }
        self.cancelled.store(false, Ordering::Release);
        self.update(|state| {
            let manifest = std::mem::take(&mut state.uploaded_media);
            *state = MigrationState {
                status: MigrationStatus::InProgress,
                started_at: Some(clock::now()),
                uploaded_media: manifest,
                ..MigrationState::default()
            };
        })
        .await?;
        info!("migration started");
        self.run_from(MigrationStage::Authenticating).await
    }

    pub async fn resume_migration(&self) -> Result<MigrationState, MigrationError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(MigrationError::AlreadyRunning)?;
        let current = self.state().await;
        if current.status == MigrationStatus::Completed {
            return Err(MigrationError::AlreadyCompleted);
        }
        if !current.is_resumable() {
            return Err(MigrationError::NotResumable(current.status));
        }
        self.cancelled.store(false, Ordering::Release);
        let stage = current.current_stage.max(MigrationStage::Authenticating);
        info!(stage = stage.as_str(), progress = current.progress, "migration resumed");
        self.run_from(stage).await
    }

    /// Stops a running migration at the next item boundary. A migration
    /// left in progress by a dead process is marked failed right away.
    pub async fn cancel(&self) -> Result<(), MigrationError> {
        self.cancelled.store(true, Ordering::Release);
        if !self.is_running() && self.state().await.status == MigrationStatus::InProgress {
            self.fail_with(CANCELLED_BY_USER).await?;
        }
        Ok(())
    }

    /// Operator action: forget the migration entirely.
    pub async fn reset(&self) -> Result<(), MigrationError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(MigrationError::AlreadyRunning)?;
        let mut state = self.state.lock().await;
        self.store.clear().await?;
        *state = MigrationState::default();
        *self.backup.lock().await = None;
        warn!("migration state reset");
        Ok(())
    }

    /// Best-effort undo of this process's run: remote deletes that fail are
    /// logged and skipped, local sync metadata is always cleared.
    pub async fn rollback(&self) -> Result<RollbackReport, MigrationError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(MigrationError::AlreadyRunning)?;
        let mut backup_slot = self.backup.lock().await;
        let Some(backup) = backup_slot.as_ref() else {
            return Err(MigrationError::NoBackup);
        };
        let cache = self.engine.cache();
        let mut report = RollbackReport::default();

        // Children before parents.
        for entity in backup.entities.iter().rev() {
            if entity.server_id.is_some() {
                continue;
            }
            let Some(current) = cache.fetch(entity.entity_type, &entity.local_id).await? else {
                continue;
            };
            let Some(server_id) = current.server_id.as_deref() else {
                continue;
            };
            match self.engine.delete_remote(entity.entity_type, server_id).await {
                Ok(()) => report.deleted_entities += 1,
                Err(err) => {
                    report.failed_deletes += 1;
                    warn!(
                        entity_type = entity.entity_type.as_str(),
                        local_id = %entity.local_id,
                        server_id,
                        error = %err,
                        "rollback delete failed"
                    );
                }
            }
        }

        let manifest = self.state().await.uploaded_media;
        for key in manifest.difference(&backup.media_before) {
            match self.engine.delete_remote_media(key).await {
                Ok(()) => report.deleted_media += 1,
                Err(err) => {
                    report.failed_deletes += 1;
                    warn!(key = %key, error = %err, "rollback media delete failed");
                }
            }
        }

        for kind in EntityType::ALL {
            cache.clear_sync_metadata(kind).await?;
        }

        let media_before = backup.media_before.clone();
        self.update(|state| {
            *state = MigrationState {
                status: MigrationStatus::RolledBack,
                current_stage: MigrationStage::Idle,
                progress: 0.0,
                uploaded_media: media_before,
                ..MigrationState::default()
            };
        })
        .await?;
        *backup_slot = None;
        info!(
            deleted_entities = report.deleted_entities,
            deleted_media = report.deleted_media,
            failed = report.failed_deletes,
            "migration rolled back"
        );
        Ok(report)
    }

    async fn run_from(&self, first: MigrationStage) -> Result<MigrationState, MigrationError> {
        let mut stage = first;
        while stage != MigrationStage::Complete {
            self.check_cancelled().await?;
            self.update(|state| {
                state.status = MigrationStatus::InProgress;
                state.current_stage = stage;
                state.error = None;
            })
            .await?;
            info!(stage = stage.as_str(), "migration stage started");

            if let Err(err) = self.run_stage(stage).await {
                let message = match &err {
                    MigrationError::AuthenticationRequired => AUTHENTICATION_REQUIRED.to_string(),
                    MigrationError::Cancelled => CANCELLED_BY_USER.to_string(),
                    other => other.to_string(),
                };
                warn!(stage = stage.as_str(), error = %message, "migration stage failed");
                self.fail_with(&message).await?;
                return Err(err);
            }

            let next = stage.next();
            self.update(|state| state.advance_progress(next.progress_floor()))
                .await?;
            stage = next;
        }

        let finished = self
            .update(|state| {
                state.status = MigrationStatus::Completed;
                state.current_stage = MigrationStage::Complete;
                state.progress = 1.0;
                state.completed_at = Some(clock::now());
                state.error = None;
            })
            .await?;
        info!("migration completed");
        Ok(finished)
    }

    async fn run_stage(&self, stage: MigrationStage) -> Result<(), MigrationError> {
        match stage {
            MigrationStage::Authenticating => self.authenticate().await,
            MigrationStage::Exporting => self.export().await,
            MigrationStage::UploadingHeroes
            | MigrationStage::UploadingStories
            | MigrationStage::UploadingCustomEvents => match stage.entity_type() {
                Some(kind) => self.upload_entities(stage, kind).await,
                None => Ok(()),
            },
            MigrationStage::UploadingMedia => self.upload_media().await,
            MigrationStage::Verifying => self.verify().await,
            // Completion is persisted by the caller once this returns.
            MigrationStage::Finalizing => Ok(()),
            MigrationStage::Idle | MigrationStage::Complete => Ok(()),
        }
    }

    async fn authenticate(&self) -> Result<(), MigrationError> {
        match self.engine.ensure_token().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_auth_required() => Err(MigrationError::AuthenticationRequired),
            Err(err) => Err(err.into()),
        }
    }

    async fn export(&self) -> Result<(), MigrationError> {
        let cache = self.engine.cache();
        let mut entities = Vec::new();
        let mut exported = Vec::new();
        for kind in EntityType::ALL {
            let rows = cache.fetch_all(kind).await?;
            exported.push((MigrationItemKind::from(kind), rows.len() as u64));
            entities.extend(rows);
        }
        let media_keys = self.engine.media().list_keys().await?;
        exported.push((MigrationItemKind::Media, media_keys.len() as u64));

        let media_before = self.state().await.uploaded_media;
        *self.backup.lock().await = Some(MigrationBackup {
            entities,
            media_before,
        });
        self.update(|state| {
            for (kind, count) in exported {
                state.exported.insert(kind, count);
            }
        })
        .await?;
        Ok(())
    }

    /// Entities that already carry a server id were uploaded by an earlier
    /// attempt and are skipped.
    async fn upload_entities(
        &self,
        stage: MigrationStage,
        kind: EntityType,
    ) -> Result<(), MigrationError> {
        let cache = self.engine.cache();
        let pending: Vec<_> = cache
            .fetch_all(kind)
            .await?
            .into_iter()
            .filter(|entity| entity.server_id.is_none())
            .collect();
        let total = pending.len();
        for (index, entity) in pending.iter().enumerate() {
            self.check_cancelled().await?;
            self.engine
                .upload_entity(entity)
                .await
                .map_err(map_auth_error)?;
            let uploaded = cache.count_uploaded(kind).await?;
            let progress = stage_progress(stage, index + 1, total);
            self.update(|state| {
                state.uploaded.insert(kind.into(), uploaded);
                state.advance_progress(progress);
            })
            .await?;
        }
        let uploaded = cache.count_uploaded(kind).await?;
        self.update(|state| {
            state.uploaded.insert(kind.into(), uploaded);
        })
        .await?;
        info!(entity_type = kind.as_str(), uploaded = total, "entities uploaded");
        Ok(())
    }

    async fn upload_media(&self) -> Result<(), MigrationError> {
        let keys = self.engine.media().list_keys().await?;
        let done = self.state().await.uploaded_media;
        let pending: Vec<_> = keys.into_iter().filter(|key| !done.contains(key)).collect();
        let total = pending.len();
        for (index, key) in pending.iter().enumerate() {
            self.check_cancelled().await?;
            if let Err(err) = self.engine.upload_media(key).await {
                warn!(
                    key = %key,
                    retryable = err.is_transient(),
                    error = %err,
                    "media upload failed"
                );
                return Err(map_auth_error(err));
            }
            let progress = stage_progress(MigrationStage::UploadingMedia, index + 1, total);
            self.update(|state| {
                state.uploaded_media.insert(key.clone());
                let count = state.uploaded_media.len() as u64;
                state.uploaded.insert(MigrationItemKind::Media, count);
                state.advance_progress(progress);
            })
            .await?;
        }
        info!(uploaded = total, "media uploaded");
        Ok(())
    }

    async fn verify(&self) -> Result<(), MigrationError> {
        let cache = self.engine.cache();
        let mut uploaded_counts = Vec::new();
        for kind in EntityType::ALL {
            uploaded_counts.push((MigrationItemKind::from(kind), cache.count_uploaded(kind).await?));
        }
        let state = self
            .update(|state| {
                for (kind, count) in &uploaded_counts {
                    state.uploaded.insert(*kind, *count);
                }
                let media = state.uploaded_media.len() as u64;
                state.uploaded.insert(MigrationItemKind::Media, media);
            })
            .await?;

        for kind in [
            MigrationItemKind::Hero,
            MigrationItemKind::Story,
            MigrationItemKind::CustomEvent,
            MigrationItemKind::Media,
        ] {
            let exported = state.exported_count(kind);
            let uploaded = state.uploaded_count(kind);
            if uploaded < exported {
                return Err(MigrationError::VerificationFailed {
                    kind,
                    exported,
                    uploaded,
                });
            }
        }
        Ok(())
    }

    async fn check_cancelled(&self) -> Result<(), MigrationError> {
        if self.cancelled.swap(false, Ordering::AcqRel) {
            return Err(MigrationError::Cancelled);
        }
        Ok(())
    }

    async fn fail_with(&self, message: &str) -> Result<MigrationState, MigrationError> {
        self.update(|state| {
            state.status = MigrationStatus::Failed;
            state.error = Some(message.to_string());
        })
        .await
    }

    /// Applies `change` and persists the result before anyone can observe it.
    async fn update<F>(&self, change: F) -> Result<MigrationState, MigrationError>
    where
        F: FnOnce(&mut MigrationState),
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        change(&mut next);
        self.store.save(&next).await?;
        *state = next.clone();
        Ok(next)
    }
}

fn map_auth_error(err: EngineError) -> MigrationError {
    if err.is_auth_required() {
        MigrationError::AuthenticationRequired
    } else {
        MigrationError::Engine(err)
    }
}

fn stage_progress(stage: MigrationStage, done: usize, total: usize) -> f64 {
    let floor = stage.progress_floor();
    if total == 0 {
        return floor;
    }
    floor + stage.weight() * (done as f64 / total as f64)
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
