use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::{Database, StoreError};
use crate::clock;

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Versioned {
    version: u32,
    data: serde_json::Value,
}

/// Durable key-value storage for JSON documents.
///
/// Every write is committed before the call returns.
#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn put_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(clock::to_millis(clock::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loads a `{"version": N, "data": ...}` document written by
    /// [`KvStore::store_versioned`].
    pub async fn load_versioned<T: DeserializeOwned>(
        &self,
        key: &str,
        expected: u32,
    ) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };
        let doc: Versioned = serde_json::from_str(&raw)?;
        if doc.version != expected {
            return Err(StoreError::UnsupportedVersion {
                key: key.to_string(),
                found: doc.version,
                expected,
            });
        }
        Ok(Some(serde_json::from_value(doc.data)?))
    }

    pub async fn store_versioned<T: Serialize>(
        &self,
        key: &str,
        version: u32,
        data: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&VersionedRef { version, data })?;
        self.put_raw(key, &raw).await
    }
}
