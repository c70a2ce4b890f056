use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use crate::clock;
use crate::model::EntityType;
use crate::storage::{KvStore, StoreError};

const QUEUE_KEY: &str = "sync.queue";
const QUEUE_VERSION: u32 = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// Drain order: higher first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation_type: OperationType,
    pub priority: Priority,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Assigned on enqueue; breaks ties within a priority.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub retry_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub error: Option<String>,
    /// Remote id captured when the operation was queued; deletes need it
    /// after the local row is gone.
    #[serde(default)]
    pub server_id: Option<String>,
}

impl SyncOperation {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation_type: OperationType,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            entity_id: entity_id.into(),
            operation_type,
            priority,
            created_at: clock::now(),
            sequence: 0,
            attempt_count: 0,
            last_attempt_at: None,
            retry_at: None,
            error: None,
            server_id: None,
        }
    }

    pub fn with_server_id(mut self, server_id: Option<String>) -> Self {
        self.server_id = server_id;
        self
    }

    fn same_target(&self, other: &SyncOperation) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.operation_type == other.operation_type
    }

    fn is_due(&self, now: OffsetDateTime) -> bool {
        match (self.last_attempt_at, self.retry_at) {
            (None, _) => true,
            (Some(_), Some(retry_at)) => now >= retry_at,
            (Some(_), None) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Store(#[from] StoreError),
    #[error("operation {0} is not queued")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub exhausted: usize,
    pub by_entity: BTreeMap<EntityType, usize>,
    pub by_operation: BTreeMap<OperationType, usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueDocument {
    next_sequence: u64,
    operations: Vec<SyncOperation>,
}

impl QueueDocument {
    fn sort(&mut self) {
        self.operations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.operations.iter().position(|op| op.id == id)
    }
}

/// Persistent queue of pending mutations.
///
/// All access goes through one mutex, and every mutation is written to the
/// key-value store before the lock is released.
pub struct DurableQueue {
    kv: KvStore,
    inner: Mutex<QueueDocument>,
    max_retries: u32,
    backoff: Backoff,
}

impl DurableQueue {
    pub async fn open(kv: KvStore) -> Result<Self, QueueError> {
        let mut doc: QueueDocument = kv
            .load_versioned(QUEUE_KEY, QUEUE_VERSION)
            .await?
            .unwrap_or_default();
        doc.sort();
        debug!(operations = doc.operations.len(), "sync queue loaded");
        Ok(Self {
            kv,
            inner: Mutex::new(doc),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_exhausted(&self, op: &SyncOperation) -> bool {
        op.attempt_count >= self.max_retries
    }

    /// Returns `false` when an operation for the same entity and verb is
    /// already queued.
    pub async fn enqueue(&self, mut op: SyncOperation) -> Result<bool, QueueError> {
        let mut doc = self.inner.lock().await;
        if doc.operations.iter().any(|existing| existing.same_target(&op)) {
            debug!(
                entity_type = op.entity_type.as_str(),
                entity_id = %op.entity_id,
                operation = ?op.operation_type,
                "duplicate enqueue ignored"
            );
            return Ok(false);
        }
        let mut next = doc.clone();
        op.sequence = next.next_sequence;
        next.next_sequence = next.next_sequence.saturating_add(1);
        info!(
            id = %op.id,
            entity_type = op.entity_type.as_str(),
            entity_id = %op.entity_id,
            operation = ?op.operation_type,
            priority = ?op.priority,
            "operation enqueued"
        );
        next.operations.push(op);
        next.sort();
        self.commit(&mut doc, next).await?;
        Ok(true)
    }

    /// Like [`enqueue`](Self::enqueue), but an exhausted operation for the
    /// same target is made ready again instead of blocking the new one.
    pub async fn enqueue_or_reset(&self, op: SyncOperation) -> Result<bool, QueueError> {
        let exhausted = {
            let doc = self.inner.lock().await;
            doc.operations
                .iter()
                .find(|existing| existing.same_target(&op))
                .filter(|existing| self.is_exhausted(existing))
                .map(|existing| existing.id)
        };
        match exhausted {
            Some(id) => {
                info!(id = %id, "exhausted operation re-armed by a new change");
                self.reset_attempts(id).await?;
                Ok(true)
            }
            None => self.enqueue(op).await,
        }
    }

    pub async fn dequeue_by_id(&self, id: Uuid) -> Result<Option<SyncOperation>, QueueError> {
        let mut doc = self.inner.lock().await;
        let Some(index) = doc.position(id) else {
            return Ok(None);
        };
        let mut next = doc.clone();
        let removed = next.operations.remove(index);
        self.commit(&mut doc, next).await?;
        debug!(id = %id, "operation dequeued");
        Ok(Some(removed))
    }

    /// Drops every queued operation that targets the given entity.
    pub async fn remove_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<usize, QueueError> {
        let mut doc = self.inner.lock().await;
        let mut next = doc.clone();
        next.operations
            .retain(|op| !(op.entity_type == entity_type && op.entity_id == entity_id));
        let removed = doc.operations.len() - next.operations.len();
        if removed > 0 {
            self.commit(&mut doc, next).await?;
        }
        Ok(removed)
    }

    /// Operations that may be attempted at `now`, in drain order.
    pub async fn ready_operations(&self, now: OffsetDateTime) -> Vec<SyncOperation> {
        let doc = self.inner.lock().await;
        doc.operations
            .iter()
            .filter(|op| op.attempt_count < self.max_retries && op.is_due(now))
            .cloned()
            .collect()
    }

    pub async fn mark_attempted(&self, id: Uuid, error: Option<&str>) -> Result<(), QueueError> {
        self.mark_attempted_at(id, error, clock::now(), None).await
    }

    /// Records an attempt at `now`. `retry_hint` (a server `Retry-After`)
    /// can only push the next attempt later, never earlier.
    pub async fn mark_attempted_at(
        &self,
        id: Uuid,
        error: Option<&str>,
        now: OffsetDateTime,
        retry_hint: Option<Duration>,
    ) -> Result<(), QueueError> {
        let mut doc = self.inner.lock().await;
        let index = doc.position(id).ok_or(QueueError::NotFound(id))?;
        let mut next = doc.clone();
        let op = &mut next.operations[index];
        op.attempt_count = op.attempt_count.saturating_add(1);
        op.last_attempt_at = Some(now);
        op.error = error.map(str::to_string);
        let delay = self
            .backoff
            .delay(op.attempt_count)
            .max(retry_hint.unwrap_or(Duration::ZERO));
        op.retry_at = Some(now + delay);
        if op.attempt_count >= self.max_retries {
            warn!(
                id = %id,
                entity_type = op.entity_type.as_str(),
                entity_id = %op.entity_id,
                attempts = op.attempt_count,
                "operation exhausted its retries"
            );
        } else {
            debug!(
                id = %id,
                attempts = op.attempt_count,
                retry_in_secs = delay.as_secs_f64(),
                "operation attempt recorded"
            );
        }
        self.commit(&mut doc, next).await
    }

    /// Records a rejection that no retry can fix. The operation stays queued
    /// as exhausted until it is reset or purged.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let mut doc = self.inner.lock().await;
        let index = doc.position(id).ok_or(QueueError::NotFound(id))?;
        let mut next = doc.clone();
        let op = &mut next.operations[index];
        op.attempt_count = op.attempt_count.saturating_add(1).max(self.max_retries);
        op.last_attempt_at = Some(clock::now());
        op.retry_at = None;
        op.error = Some(error.to_string());
        warn!(
            id = %id,
            entity_type = op.entity_type.as_str(),
            entity_id = %op.entity_id,
            "operation failed permanently"
        );
        self.commit(&mut doc, next).await
    }

    /// Manual regeneration: the operation becomes ready again.
    pub async fn reset_attempts(&self, id: Uuid) -> Result<(), QueueError> {
        let mut doc = self.inner.lock().await;
        let index = doc.position(id).ok_or(QueueError::NotFound(id))?;
        let mut next = doc.clone();
        let op = &mut next.operations[index];
        op.attempt_count = 0;
        op.last_attempt_at = None;
        op.retry_at = None;
        op.error = None;
        self.commit(&mut doc, next).await
    }

    /// Purges operations that exhausted their retries.
    pub async fn clear_failed_operations(&self) -> Result<usize, QueueError> {
        let mut doc = self.inner.lock().await;
        let mut next = doc.clone();
        next.operations
            .retain(|op| op.attempt_count < self.max_retries);
        let removed = doc.operations.len() - next.operations.len();
        if removed > 0 {
            self.commit(&mut doc, next).await?;
            info!(removed, "failed operations purged");
        }
        Ok(removed)
    }

    pub async fn failed_operations(&self) -> Vec<SyncOperation> {
        let doc = self.inner.lock().await;
        doc.operations
            .iter()
            .filter(|op| self.is_exhausted(op))
            .cloned()
            .collect()
    }

    pub async fn operations(&self) -> Vec<SyncOperation> {
        self.inner.lock().await.operations.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<SyncOperation> {
        let doc = self.inner.lock().await;
        doc.operations.iter().find(|op| op.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.operations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.operations.is_empty()
    }

    pub async fn statistics(&self) -> QueueStats {
        let doc = self.inner.lock().await;
        let mut stats = QueueStats {
            total: doc.operations.len(),
            ..QueueStats::default()
        };
        for op in &doc.operations {
            *stats.by_entity.entry(op.entity_type).or_default() += 1;
            *stats.by_operation.entry(op.operation_type).or_default() += 1;
            if self.is_exhausted(op) {
                stats.exhausted += 1;
            }
        }
        stats
    }

    async fn commit(
        &self,
        current: &mut QueueDocument,
        next: QueueDocument,
    ) -> Result<(), QueueError> {
        self.kv
            .store_versioned(QUEUE_KEY, QUEUE_VERSION, &next)
            .await?;
        *current = next;
        Ok(())
    }
}
