use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use tracing::debug;

use crate::clock;
use crate::model::{EntityType, SyncStatus, SyncableEntity};
use crate::storage::{Database, StoreError};

const ENTITY_COLUMNS: &str = "entity_type, local_id, server_id, parent_id, payload, sync_status, \
     last_synced_at, server_updated_at, local_updated_at, pending_changes, sync_error";

/// Local copy of every syncable entity plus its sync metadata.
///
/// Writes go straight to SQLite; there is no write-behind.
#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn save(&self, entity: &SyncableEntity) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&entity.payload)?;
        sqlx::query(
            "INSERT INTO entities (
                entity_type,
                local_id,
                server_id,
                parent_id,
                payload,
                sync_status,
                last_synced_at,
                server_updated_at,
                local_updated_at,
                pending_changes,
                sync_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(entity_type, local_id) DO UPDATE SET
                server_id = excluded.server_id,
                parent_id = excluded.parent_id,
                payload = excluded.payload,
                sync_status = excluded.sync_status,
                last_synced_at = excluded.last_synced_at,
                server_updated_at = excluded.server_updated_at,
                local_updated_at = excluded.local_updated_at,
                pending_changes = excluded.pending_changes,
                sync_error = excluded.sync_error",
        )
        .bind(entity.entity_type.as_str())
        .bind(&entity.local_id)
        .bind(&entity.server_id)
        .bind(&entity.parent_id)
        .bind(payload)
        .bind(entity.sync_status.as_str())
        .bind(entity.last_synced_at.map(clock::to_millis))
        .bind(entity.server_updated_at.map(clock::to_millis))
        .bind(clock::to_millis(entity.local_updated_at))
        .bind(&entity.pending_changes)
        .bind(&entity.sync_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch(
        &self,
        entity_type: EntityType,
        local_id: &str,
    ) -> Result<Option<SyncableEntity>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?1 AND local_id = ?2"
        ))
        .bind(entity_type.as_str())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    pub async fn fetch_by_server_id(
        &self,
        entity_type: EntityType,
        server_id: &str,
    ) -> Result<Option<SyncableEntity>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?1 AND server_id = ?2"
        ))
        .bind(entity_type.as_str())
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    pub async fn fetch_all(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<SyncableEntity>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE entity_type = ?1
             ORDER BY local_updated_at ASC, local_id ASC"
        ))
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entity_from_row).collect()
    }

    /// Entities with the given status, or every entity not yet `synced`.
    pub async fn fetch_pending_sync(
        &self,
        entity_type: EntityType,
        status: Option<SyncStatus>,
    ) -> Result<Vec<SyncableEntity>, StoreError> {
        let query = match status {
            Some(_) => format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE entity_type = ?1 AND sync_status = ?2
                 ORDER BY local_updated_at ASC, local_id ASC"
            ),
            None => format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE entity_type = ?1 AND sync_status != ?2
                 ORDER BY local_updated_at ASC, local_id ASC"
            ),
        };
        let rows = sqlx::query(&query)
            .bind(entity_type.as_str())
            .bind(status.unwrap_or(SyncStatus::Synced).as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entity_from_row).collect()
    }

    pub async fn delete(&self, entity: &SyncableEntity) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM entities WHERE entity_type = ?1 AND local_id = ?2")
                .bind(entity.entity_type.as_str())
                .bind(&entity.local_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves the entity to `status` and persists it. Reaching `synced`
    /// clears pending changes and stamps `last_synced_at`.
    pub async fn mark_for_sync(
        &self,
        entity: &mut SyncableEntity,
        status: SyncStatus,
    ) -> Result<(), StoreError> {
        self.mark_for_sync_at(entity, status, clock::now()).await
    }

    pub async fn mark_for_sync_at(
        &self,
        entity: &mut SyncableEntity,
        status: SyncStatus,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        entity.sync_status = status;
        if status == SyncStatus::Synced {
            let floor = entity.server_updated_at.unwrap_or(now);
            entity.last_synced_at = Some(now.max(floor));
            entity.pending_changes = None;
            entity.sync_error = None;
        }
        self.save(entity).await?;
        debug!(
            entity_type = entity.entity_type.as_str(),
            local_id = %entity.local_id,
            status = status.as_str(),
            "sync status updated"
        );
        Ok(())
    }

    /// Forgets everything learned from the server for one kind, keeping the
    /// local content.
    pub async fn clear_sync_metadata(&self, entity_type: EntityType) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE entities SET
                server_id = NULL,
                sync_status = ?2,
                last_synced_at = NULL,
                server_updated_at = NULL,
                pending_changes = NULL,
                sync_error = NULL
             WHERE entity_type = ?1",
        )
        .bind(entity_type.as_str())
        .bind(SyncStatus::NotSynced.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self, entity_type: EntityType) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM entities WHERE entity_type = ?1")
            .bind(entity_type.as_str())
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    /// Entities that already have a remote identity.
    pub async fn count_uploaded(&self, entity_type: EntityType) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM entities WHERE entity_type = ?1 AND server_id IS NOT NULL",
        )
        .bind(entity_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or(0))
    }
}

fn entity_from_row(row: &SqliteRow) -> Result<SyncableEntity, StoreError> {
    let entity_type: String = row.try_get("entity_type")?;
    let status: String = row.try_get("sync_status")?;
    let payload: String = row.try_get("payload")?;
    let local_updated_at: i64 = row.try_get("local_updated_at")?;
    Ok(SyncableEntity {
        entity_type: EntityType::parse(&entity_type)
            .ok_or(StoreError::InvalidEntityType(entity_type))?,
        local_id: row.try_get("local_id")?,
        server_id: row.try_get("server_id")?,
        parent_id: row.try_get("parent_id")?,
        payload: serde_json::from_str::<Value>(&payload)?,
        sync_status: SyncStatus::parse(&status).ok_or(StoreError::InvalidStatus(status))?,
        last_synced_at: optional_time(row.try_get("last_synced_at")?)?,
        server_updated_at: optional_time(row.try_get("server_updated_at")?)?,
        local_updated_at: clock::from_millis(local_updated_at)
            .ok_or(StoreError::InvalidTimestamp(local_updated_at))?,
        pending_changes: row.try_get("pending_changes")?,
        sync_error: row.try_get("sync_error")?,
    })
}

fn optional_time(millis: Option<i64>) -> Result<Option<OffsetDateTime>, StoreError> {
    millis
        .map(|value| clock::from_millis(value).ok_or(StoreError::InvalidTimestamp(value)))
        .transpose()
}
