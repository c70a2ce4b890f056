use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use storysync_core::{
    ApiError, ApiErrorClass, EntityWrite, RemoteEntity, StoryClient, UpdateOutcome,
};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::{ConflictDecision, ConflictResolver};
use super::queue::{DurableQueue, OperationType, Priority, QueueError, SyncOperation};
use crate::cache::CacheStore;
use crate::clock;
use crate::model::{EntityType, SyncStatus, SyncableEntity};
use crate::storage::{AuthSession, MediaError, MediaStore, StoreError, content_type_for};
use crate::token_provider::{TokenProvider, TokenProviderError};
use crate::transfer::{BlobTransfer, TransferError};

/// Error recorded on an operation whose request was abandoned by a
/// cancelled run.
pub const ATTEMPT_INTERRUPTED: &str = "attempt interrupted before the server answered";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("token error: {0}")]
    Token(#[from] TokenProviderError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("not signed in")]
    NotAuthenticated,
    #[error("session expired; sign in again")]
    SessionExpired,
    #[error("parent {parent_id} of {entity_type:?} {local_id} has no server id yet")]
    ParentNotSynced {
        entity_type: EntityType,
        local_id: String,
        parent_id: String,
    },
}

impl EngineError {
    pub fn is_auth_required(&self) -> bool {
        matches!(self, EngineError::NotAuthenticated | EngineError::SessionExpired)
    }

    /// Worth another attempt later without any change on this side.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Api(err) => err.is_retryable(),
            EngineError::Transfer(err) => err.is_retryable(),
            EngineError::ParentNotSynced { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Draining,
    Attempting,
}

impl SyncPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncPhase::Draining,
            2 => SyncPhase::Attempting,
            _ => SyncPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another run was in flight; nothing was done.
    pub skipped: bool,
    pub attempted: usize,
    pub applied: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Stopped early by cancellation; unattempted work stays queued.
    pub interrupted: bool,
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

enum OpOutcome {
    Applied,
    Conflict,
    RetryScheduled,
    Failed,
}

/// Clears the in-flight flag when a run ends, however it ends.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
    phase: &'a AtomicU8,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, phase: &'a AtomicU8) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, phase })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(SyncPhase::Idle as u8, Ordering::Release);
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    client: StoryClient,
    cache: CacheStore,
    queue: DurableQueue,
    resolver: ConflictResolver,
    tokens: Mutex<TokenProvider>,
    media: MediaStore,
    transfer: BlobTransfer,
    /// Serializes read-modify-write sequences on cached rows together with
    /// the queue entries that track them.
    edits: Mutex<()>,
    in_flight: AtomicBool,
    phase: AtomicU8,
}

impl SyncEngine {
    pub fn new(
        client: StoryClient,
        cache: CacheStore,
        queue: DurableQueue,
        tokens: TokenProvider,
        media: MediaStore,
    ) -> Self {
        Self {
            client,
            cache,
            queue,
            resolver: ConflictResolver::default(),
            tokens: Mutex::new(tokens),
            media,
            transfer: BlobTransfer::new(),
            edits: Mutex::new(()),
            in_flight: AtomicBool::new(false),
            phase: AtomicU8::new(SyncPhase::Idle as u8),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_transfer(mut self, transfer: BlobTransfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn client(&self) -> &StoryClient {
        &self.client
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.lock().await.is_authenticated()
    }

    pub async fn sign_in(&self, session: AuthSession) -> Result<(), EngineError> {
        let mut tokens = self.tokens.lock().await;
        self.client.set_token(session.access_token.clone());
        tokens.sign_in(session).await?;
        Ok(())
    }

    /// Persists a local create or edit and queues it for upload. An
    /// operation for the same change that had failed for good is re-armed.
    pub async fn track_change(
        &self,
        entity: &mut SyncableEntity,
        operation: OperationType,
        priority: Priority,
    ) -> Result<bool, EngineError> {
        let _edits = self.edits.lock().await;
        if entity.server_id.is_none() {
            // The caller's copy may predate a create that has since landed.
            if let Some(stored) = self.cache.fetch(entity.entity_type, &entity.local_id).await? {
                if stored.server_id.is_some() {
                    entity.server_id = stored.server_id;
                    entity.server_updated_at = stored.server_updated_at;
                    entity.last_synced_at = stored.last_synced_at;
                }
            }
        }
        entity.sync_status = SyncStatus::Pending;
        entity.sync_error = None;
        self.cache.save(entity).await?;
        let op = SyncOperation::new(entity.entity_type, &entity.local_id, operation, priority)
            .with_server_id(entity.server_id.clone());
        Ok(self.queue.enqueue_or_reset(op).await?)
    }

    /// Removes the entity locally, drops its queued work, and queues a remote
    /// delete when the server already knows about it.
    pub async fn track_delete(
        &self,
        entity: &SyncableEntity,
        priority: Priority,
    ) -> Result<bool, EngineError> {
        let _edits = self.edits.lock().await;
        self.queue
            .remove_for_entity(entity.entity_type, &entity.local_id)
            .await?;
        self.cache.delete(entity).await?;
        let Some(server_id) = entity.server_id.clone() else {
            return Ok(false);
        };
        let op = SyncOperation::new(
            entity.entity_type,
            &entity.local_id,
            OperationType::Delete,
            priority,
        )
        .with_server_id(Some(server_id));
        Ok(self.queue.enqueue(op).await?)
    }

    /// Drains every ready operation once. Overlapping calls return a
    /// skipped report immediately.
    pub async fn sync_all(&self) -> Result<SyncReport, EngineError> {
        self.sync_until(&CancellationToken::new()).await
    }

    /// Like [`sync_all`](Self::sync_all), but stops once `cancel` fires. An
    /// operation whose request is still out at that point is abandoned and
    /// recorded as a failed attempt.
    pub async fn sync_until(&self, cancel: &CancellationToken) -> Result<SyncReport, EngineError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &self.phase) else {
            debug!("sync already in flight; skipping");
            return Ok(SyncReport::skipped());
        };
        self.set_phase(SyncPhase::Draining);

        let ready = self.queue.ready_operations(clock::now()).await;
        let mut report = SyncReport::default();
        if ready.is_empty() {
            debug!("sync queue has nothing ready");
            return Ok(report);
        }
        self.ensure_token().await?;
        info!(ready = ready.len(), "sync run started");

        for op in &ready {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            // Earlier operations in this run may have dropped it.
            if self.queue.get(op.id).await.is_none() {
                continue;
            }
            self.set_phase(SyncPhase::Attempting);
            report.attempted += 1;
            let outcome = tokio::select! {
                outcome = self.process(op) => outcome?,
                _ = cancel.cancelled() => {
                    self.abandon(op).await?;
                    report.interrupted = true;
                    break;
                }
            };
            match outcome {
                OpOutcome::Applied => report.applied += 1,
                OpOutcome::Conflict => report.conflicts += 1,
                OpOutcome::RetryScheduled => report.retry_scheduled += 1,
                OpOutcome::Failed => report.failed += 1,
            }
            self.set_phase(SyncPhase::Draining);
        }

        info!(
            attempted = report.attempted,
            applied = report.applied,
            retry_scheduled = report.retry_scheduled,
            failed = report.failed,
            conflicts = report.conflicts,
            interrupted = report.interrupted,
            "sync run finished"
        );
        Ok(report)
    }

    /// Creates `entity` remotely and records its server identity locally.
    pub async fn upload_entity(
        &self,
        entity: &SyncableEntity,
    ) -> Result<SyncableEntity, EngineError> {
        self.authorized(|| self.create_remote(entity, None)).await
    }

    pub async fn upload_media(&self, key: &str) -> Result<(), EngineError> {
        let source = self.media.path_for(key)?;
        let source = source.as_path();
        let content_type = content_type_for(key);
        self.authorized(|| async move {
            let link = self.client.media_upload_link(key, content_type).await?;
            self.transfer
                .upload_from_path(&link, source, content_type)
                .await?;
            Ok::<(), EngineError>(())
        })
        .await
    }

    pub async fn download_media(&self, key: &str) -> Result<PathBuf, EngineError> {
        let target = self.media.path_for(key)?;
        let path = target.as_path();
        self.authorized(|| async move {
            let link = self.client.media_download_link(key).await?;
            self.transfer.download_to_path(&link, path).await?;
            Ok::<(), EngineError>(())
        })
        .await?;
        Ok(target)
    }

    pub async fn delete_remote(&self, kind: EntityType, server_id: &str) -> Result<(), EngineError> {
        self.authorized(|| async move {
            self.client.delete_entity(kind, server_id).await?;
            Ok::<(), EngineError>(())
        })
        .await
    }

    pub async fn delete_remote_media(&self, key: &str) -> Result<(), EngineError> {
        self.authorized(|| async move {
            self.client.delete_media(key).await?;
            Ok::<(), EngineError>(())
        })
        .await
    }

    /// Makes sure the client carries a usable bearer token.
    pub async fn ensure_token(&self) -> Result<(), EngineError> {
        let mut tokens = self.tokens.lock().await;
        if !tokens.is_authenticated() {
            return Err(EngineError::NotAuthenticated);
        }
        match tokens.valid_access_token().await {
            Ok(token) => {
                self.client.set_token(token);
                Ok(())
            }
            Err(err) => Self::end_session_on_rejection(&mut tokens, err).await,
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    async fn process(&self, op: &SyncOperation) -> Result<OpOutcome, EngineError> {
        debug!(
            id = %op.id,
            entity_type = op.entity_type.as_str(),
            entity_id = %op.entity_id,
            operation = ?op.operation_type,
            attempt = op.attempt_count + 1,
            "attempting operation"
        );
        let seen = self
            .cache
            .fetch(op.entity_type, &op.entity_id)
            .await?
            .map(|entity| entity.local_updated_at);
        match self.authorized(|| self.execute(op)).await {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::Api(err)) => self.handle_api_failure(op, seen, err).await,
            Err(err @ EngineError::ParentNotSynced { .. }) => {
                self.schedule_retry(op, &err.to_string(), None).await
            }
            Err(err) => Err(err),
        }
    }

    async fn execute(&self, op: &SyncOperation) -> Result<OpOutcome, EngineError> {
        if op.operation_type == OperationType::Delete {
            return self.execute_delete(op).await;
        }
        let Some(entity) = self.cache.fetch(op.entity_type, &op.entity_id).await? else {
            debug!(id = %op.id, "entity no longer cached; dropping operation");
            self.queue.dequeue_by_id(op.id).await?;
            return Ok(OpOutcome::Applied);
        };
        match entity.server_id.clone() {
            None => {
                self.create_remote(&entity, Some(op)).await?;
                Ok(OpOutcome::Applied)
            }
            Some(server_id) => self.execute_update(op, entity, &server_id).await,
        }
    }

    async fn execute_update(
        &self,
        op: &SyncOperation,
        entity: SyncableEntity,
        server_id: &str,
    ) -> Result<OpOutcome, EngineError> {
        let parent_id = self.parent_server_id(&entity).await?;
        let body = EntityWrite {
            data: &entity.payload,
            parent_id: parent_id.as_deref(),
            expected_updated_at: entity.server_updated_at,
        };
        let result = self
            .client
            .update_entity(entity.entity_type, server_id, &body, false)
            .await;
        match result {
            Ok(UpdateOutcome::Applied(remote)) => {
                self.record_push(&entity, &remote, Some(op)).await?;
                Ok(OpOutcome::Applied)
            }
            Ok(UpdateOutcome::Conflict(remote)) => self.resolve_conflict(op, entity, remote).await,
            Err(err) if err.classification() == ApiErrorClass::NotFound => {
                info!(
                    entity_type = entity.entity_type.as_str(),
                    local_id = %entity.local_id,
                    "entity was deleted remotely; removing local copy"
                );
                let _edits = self.edits.lock().await;
                self.queue
                    .remove_for_entity(entity.entity_type, &entity.local_id)
                    .await?;
                self.cache.delete(&entity).await?;
                Ok(OpOutcome::Applied)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resolve_conflict(
        &self,
        op: &SyncOperation,
        mut entity: SyncableEntity,
        remote: RemoteEntity,
    ) -> Result<OpOutcome, EngineError> {
        let decision = self.resolver.reconcile(&entity, &remote);
        info!(
            entity_type = entity.entity_type.as_str(),
            local_id = %entity.local_id,
            decision = decision.as_str(),
            "concurrent remote change"
        );
        if let ConflictDecision::KeepLocalPush = decision {
            return self.force_push(op, &entity, &remote.id).await;
        }
        let edits = self.edits.lock().await;
        if let Some(outcome) = self.retire_if_superseded(op, &entity).await? {
            return Ok(outcome);
        }
        let outcome = match decision {
            ConflictDecision::Merge(merged) => {
                self.cache.save(&merged).await?;
                drop(edits);
                return self.force_push(op, &merged, &remote.id).await;
            }
            ConflictDecision::AcceptRemote => {
                entity.apply_remote(&remote, clock::now());
                self.cache.save(&entity).await?;
                OpOutcome::Applied
            }
            ConflictDecision::NoOp => {
                entity.server_updated_at = Some(remote.updated_at);
                self.cache
                    .mark_for_sync(&mut entity, SyncStatus::Synced)
                    .await?;
                OpOutcome::Applied
            }
            ConflictDecision::KeepLocalPush | ConflictDecision::ConflictUnresolved => {
                self.mark_conflict(&mut entity).await?;
                OpOutcome::Conflict
            }
        };
        self.queue.dequeue_by_id(op.id).await?;
        Ok(outcome)
    }

    async fn force_push(
        &self,
        op: &SyncOperation,
        entity: &SyncableEntity,
        server_id: &str,
    ) -> Result<OpOutcome, EngineError> {
        let parent_id = self.parent_server_id(entity).await?;
        let body = EntityWrite {
            data: &entity.payload,
            parent_id: parent_id.as_deref(),
            expected_updated_at: None,
        };
        match self
            .client
            .update_entity(entity.entity_type, server_id, &body, true)
            .await?
        {
            UpdateOutcome::Applied(remote) => {
                self.record_push(entity, &remote, Some(op)).await?;
                Ok(OpOutcome::Applied)
            }
            UpdateOutcome::Conflict(_) => {
                let _edits = self.edits.lock().await;
                if let Some(outcome) = self.retire_if_superseded(op, entity).await? {
                    return Ok(outcome);
                }
                let mut entity = entity.clone();
                self.mark_conflict(&mut entity).await?;
                self.queue.dequeue_by_id(op.id).await?;
                Ok(OpOutcome::Conflict)
            }
        }
    }

    async fn execute_delete(&self, op: &SyncOperation) -> Result<OpOutcome, EngineError> {
        let local = self.cache.fetch(op.entity_type, &op.entity_id).await?;
        let server_id = op
            .server_id
            .clone()
            .or_else(|| local.as_ref().and_then(|entity| entity.server_id.clone()));
        if let Some(server_id) = server_id {
            self.client.delete_entity(op.entity_type, &server_id).await?;
        }
        if let Some(entity) = local {
            self.cache.delete(&entity).await?;
        }
        self.queue.dequeue_by_id(op.id).await?;
        Ok(OpOutcome::Applied)
    }

    async fn create_remote(
        &self,
        entity: &SyncableEntity,
        op: Option<&SyncOperation>,
    ) -> Result<SyncableEntity, EngineError> {
        let parent_id = self.parent_server_id(entity).await?;
        let body = EntityWrite {
            data: &entity.payload,
            parent_id: parent_id.as_deref(),
            expected_updated_at: None,
        };
        let remote = self
            .client
            .create_entity(entity.entity_type, &body, &entity.local_id)
            .await?;
        info!(
            entity_type = entity.entity_type.as_str(),
            local_id = %entity.local_id,
            server_id = %remote.id,
            "entity created remotely"
        );
        self.record_push(entity, &remote, op).await
    }

    /// Stores the server acknowledgement of `pushed` and retires the work
    /// behind it in one step under the edit lock.
    ///
    /// `op` is the queued operation that drove the push; without one, any
    /// queued work for the entity is dropped once it is synced. Edits made
    /// while the request was in flight stay pending with a follow-up queued.
    /// A row deleted meanwhile gets a remote delete queued instead of being
    /// resurrected.
    async fn record_push(
        &self,
        pushed: &SyncableEntity,
        remote: &RemoteEntity,
        op: Option<&SyncOperation>,
    ) -> Result<SyncableEntity, EngineError> {
        let _edits = self.edits.lock().await;
        let now = clock::now();
        let Some(mut current) = self
            .cache
            .fetch(pushed.entity_type, &pushed.local_id)
            .await?
        else {
            if let Some(op) = op {
                self.queue.dequeue_by_id(op.id).await?;
            }
            let delete = SyncOperation::new(
                pushed.entity_type,
                &pushed.local_id,
                OperationType::Delete,
                Priority::Medium,
            )
            .with_server_id(Some(remote.id.clone()));
            self.queue.enqueue(delete).await?;
            let mut orphan = pushed.clone();
            orphan.mark_synced(remote, now);
            return Ok(orphan);
        };

        current.server_id = Some(remote.id.clone());
        current.server_updated_at = Some(remote.updated_at);
        if current.local_updated_at != pushed.local_updated_at {
            current.last_synced_at = Some(now.max(remote.updated_at));
            current.rebase_pending(&pushed.payload);
            self.cache.save(&current).await?;
            if let Some(op) = op {
                self.queue.dequeue_by_id(op.id).await?;
            }
            let priority = op.map_or(Priority::Medium, |op| op.priority);
            self.queue_follow_up(&current, priority).await?;
            debug!(
                local_id = %current.local_id,
                "entity changed during push; follow-up queued"
            );
            return Ok(current);
        }
        self.cache
            .mark_for_sync_at(&mut current, SyncStatus::Synced, now)
            .await?;
        match op {
            Some(op) => {
                self.queue.dequeue_by_id(op.id).await?;
            }
            None => {
                self.queue
                    .remove_for_entity(current.entity_type, &current.local_id)
                    .await?;
            }
        }
        Ok(current)
    }

    /// Caller holds the edit lock. Retires `op` when the row it was built
    /// from is gone or was edited again while its request was out.
    async fn retire_if_superseded(
        &self,
        op: &SyncOperation,
        seen: &SyncableEntity,
    ) -> Result<Option<OpOutcome>, EngineError> {
        match self.cache.fetch(seen.entity_type, &seen.local_id).await? {
            None => {
                self.queue.dequeue_by_id(op.id).await?;
                Ok(Some(OpOutcome::Applied))
            }
            Some(current) if current.local_updated_at != seen.local_updated_at => {
                self.queue.dequeue_by_id(op.id).await?;
                self.queue_follow_up(&current, op.priority).await?;
                Ok(Some(OpOutcome::RetryScheduled))
            }
            Some(_) => Ok(None),
        }
    }

    /// Caller holds the edit lock.
    async fn queue_follow_up(
        &self,
        entity: &SyncableEntity,
        priority: Priority,
    ) -> Result<(), EngineError> {
        let operation = if entity.server_id.is_some() {
            OperationType::Update
        } else {
            OperationType::Create
        };
        let op = SyncOperation::new(entity.entity_type, &entity.local_id, operation, priority)
            .with_server_id(entity.server_id.clone());
        self.queue.enqueue_or_reset(op).await?;
        Ok(())
    }

    async fn parent_server_id(&self, entity: &SyncableEntity) -> Result<Option<String>, EngineError> {
        let Some(parent_id) = entity.parent_id.as_deref() else {
            return Ok(None);
        };
        let parent = self.cache.fetch(EntityType::Hero, parent_id).await?;
        match parent.and_then(|hero| hero.server_id) {
            Some(server_id) => Ok(Some(server_id)),
            None => Err(EngineError::ParentNotSynced {
                entity_type: entity.entity_type,
                local_id: entity.local_id.clone(),
                parent_id: parent_id.to_string(),
            }),
        }
    }

    async fn mark_conflict(&self, entity: &mut SyncableEntity) -> Result<(), EngineError> {
        warn!(
            entity_type = entity.entity_type.as_str(),
            local_id = %entity.local_id,
            "conflict needs manual resolution"
        );
        self.cache
            .mark_for_sync(entity, SyncStatus::Conflict)
            .await?;
        Ok(())
    }

    /// `seen` is the row's edit time when the attempt started.
    async fn handle_api_failure(
        &self,
        op: &SyncOperation,
        seen: Option<OffsetDateTime>,
        err: ApiError,
    ) -> Result<OpOutcome, EngineError> {
        let class = err.classification();
        if class == ApiErrorClass::Transient {
            return self
                .schedule_retry(op, &err.to_string(), err.retry_after())
                .await;
        }
        warn!(
            id = %op.id,
            entity_type = op.entity_type.as_str(),
            entity_id = %op.entity_id,
            class = ?class,
            error = %err,
            "operation rejected by server"
        );
        let _edits = self.edits.lock().await;
        let current = self.cache.fetch(op.entity_type, &op.entity_id).await?;
        if let Some(current) = current.as_ref() {
            if Some(current.local_updated_at) != seen {
                // The rejected content is already stale; retry the new edit.
                self.queue.dequeue_by_id(op.id).await?;
                self.queue_follow_up(current, op.priority).await?;
                return Ok(OpOutcome::RetryScheduled);
            }
        }
        if self.queue.get(op.id).await.is_none() {
            // A local delete already dropped it.
            return Ok(OpOutcome::Failed);
        }
        self.queue.mark_failed(op.id, &err.to_string()).await?;
        if let Some(mut entity) = current {
            entity.mark_error(err.to_string());
            self.cache.save(&entity).await?;
        }
        Ok(OpOutcome::Failed)
    }

    async fn schedule_retry(
        &self,
        op: &SyncOperation,
        message: &str,
        retry_hint: Option<std::time::Duration>,
    ) -> Result<OpOutcome, EngineError> {
        self.queue
            .mark_attempted_at(op.id, Some(message), clock::now(), retry_hint)
            .await?;
        let exhausted = self
            .queue
            .get(op.id)
            .await
            .is_some_and(|stored| self.queue.is_exhausted(&stored));
        if exhausted {
            self.mark_entity_error(op, message).await?;
            return Ok(OpOutcome::Failed);
        }
        debug!(id = %op.id, error = message, "operation will be retried");
        Ok(OpOutcome::RetryScheduled)
    }

    async fn abandon(&self, op: &SyncOperation) -> Result<(), EngineError> {
        warn!(id = %op.id, "run cancelled with a request in flight");
        // The dropped request may already have retired the operation.
        if self.queue.get(op.id).await.is_none() {
            return Ok(());
        }
        self.schedule_retry(op, ATTEMPT_INTERRUPTED, None).await?;
        Ok(())
    }

    async fn mark_entity_error(&self, op: &SyncOperation, message: &str) -> Result<(), EngineError> {
        let _edits = self.edits.lock().await;
        if let Some(mut entity) = self.cache.fetch(op.entity_type, &op.entity_id).await? {
            entity.mark_error(message);
            self.cache.save(&entity).await?;
        }
        Ok(())
    }

    /// Runs `call`, refreshing the session and retrying once when the
    /// server answers 401. A second 401 ends the session.
    async fn authorized<T, F, Fut>(&self, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut refreshed = false;
        loop {
            match call().await {
                Err(EngineError::Api(err)) if err.classification() == ApiErrorClass::Auth => {
                    if refreshed {
                        warn!("request unauthorized after token refresh");
                        self.tokens.lock().await.sign_out().await?;
                        return Err(EngineError::SessionExpired);
                    }
                    refreshed = true;
                    self.refresh_session().await?;
                }
                other => return other,
            }
        }
    }

    async fn refresh_session(&self) -> Result<(), EngineError> {
        let mut tokens = self.tokens.lock().await;
        match tokens.refresh_now().await {
            Ok(token) => {
                self.client.set_token(token);
                Ok(())
            }
            Err(err) => Self::end_session_on_rejection(&mut tokens, err).await,
        }
    }

    /// A rejected or unusable refresh token signs the session out; a refresh
    /// that merely failed to reach the server does not.
    async fn end_session_on_rejection(
        tokens: &mut TokenProvider,
        err: TokenProviderError,
    ) -> Result<(), EngineError> {
        let terminal = match &err {
            TokenProviderError::Auth(auth) => auth.is_rejected(),
            TokenProviderError::NotAuthenticated
            | TokenProviderError::MissingRefreshToken
            | TokenProviderError::MissingAuthClient => true,
            TokenProviderError::Store(_) => false,
        };
        if !terminal {
            return Err(err.into());
        }
        warn!(error = %err, "token refresh failed; signing out");
        tokens.sign_out().await?;
        Err(EngineError::SessionExpired)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
