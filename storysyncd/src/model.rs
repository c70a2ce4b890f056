//! Entities under synchronization and their sync metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use storysync_core::RemoteEntity;
use time::OffsetDateTime;
use uuid::Uuid;

pub use storysync_core::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NotSynced,
    Pending,
    Synced,
    Conflict,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NotSynced => "not_synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_synced" => Some(SyncStatus::NotSynced),
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "conflict" => Some(SyncStatus::Conflict),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Local edits not yet acknowledged by the server.
///
/// `base` keeps, for every top-level payload field touched since the last
/// sync, the value that field had at the last sync. A remote snapshot that
/// still carries those base values did not race with the local edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingChanges {
    pub base: BTreeMap<String, Value>,
}

impl PendingChanges {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncableEntity {
    pub entity_type: EntityType,
    pub local_id: String,
    pub server_id: Option<String>,
    /// Local id of the owning entity (a story's hero).
    pub parent_id: Option<String>,
    pub payload: Value,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<OffsetDateTime>,
    pub server_updated_at: Option<OffsetDateTime>,
    pub local_updated_at: OffsetDateTime,
    pub pending_changes: Option<String>,
    pub sync_error: Option<String>,
}

impl SyncableEntity {
    pub fn new(entity_type: EntityType, payload: Value, now: OffsetDateTime) -> Self {
        Self {
            entity_type,
            local_id: Uuid::new_v4().to_string(),
            server_id: None,
            parent_id: None,
            payload,
            sync_status: SyncStatus::NotSynced,
            last_synced_at: None,
            server_updated_at: None,
            local_updated_at: now,
            pending_changes: None,
            sync_error: None,
        }
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = local_id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Replaces the payload and records which fields moved away from their
    /// last synced values.
    pub fn record_local_edit(&mut self, payload: Value, now: OffsetDateTime) {
        let mut pending = self
            .pending_changes
            .as_deref()
            .and_then(PendingChanges::parse)
            .unwrap_or_default();
        if let (Value::Object(old), Value::Object(new)) = (&self.payload, &payload) {
            for key in old.keys().chain(new.keys()) {
                if old.get(key) != new.get(key) && !pending.base.contains_key(key) {
                    pending
                        .base
                        .insert(key.clone(), old.get(key).cloned().unwrap_or(Value::Null));
                }
            }
        }
        self.payload = payload;
        self.pending_changes = Some(pending.encode());
        self.local_updated_at = now;
        self.sync_status = SyncStatus::Pending;
        self.sync_error = None;
    }

    pub fn pending(&self) -> Option<PendingChanges> {
        self.pending_changes
            .as_deref()
            .map(|raw| PendingChanges::parse(raw).unwrap_or_default())
    }

    /// Records a server acknowledgement. `last_synced_at` never trails the
    /// server's write time.
    pub fn mark_synced(&mut self, remote: &RemoteEntity, now: OffsetDateTime) {
        self.server_id = Some(remote.id.clone());
        self.server_updated_at = Some(remote.updated_at);
        self.last_synced_at = Some(now.max(remote.updated_at));
        self.pending_changes = None;
        self.sync_error = None;
        self.sync_status = SyncStatus::Synced;
    }

    /// Overwrites local content with the server's version.
    pub fn apply_remote(&mut self, remote: &RemoteEntity, now: OffsetDateTime) {
        self.payload = remote.data.clone();
        self.mark_synced(remote, now);
    }

    /// Re-bases pending edits on a payload the server just acknowledged, so
    /// only fields changed since that push count as local edits.
    pub fn rebase_pending(&mut self, acknowledged: &Value) {
        let mut pending = PendingChanges::default();
        if let (Value::Object(ack), Value::Object(current)) = (acknowledged, &self.payload) {
            for key in ack.keys().chain(current.keys()) {
                if ack.get(key) != current.get(key) {
                    pending
                        .base
                        .insert(key.clone(), ack.get(key).cloned().unwrap_or(Value::Null));
                }
            }
        }
        self.pending_changes = Some(pending.encode());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.sync_status = SyncStatus::Error;
        self.sync_error = Some(message.into());
    }

    /// Drops everything learned from the server, keeping local content.
    pub fn reset_sync_metadata(&mut self) {
        self.server_id = None;
        self.sync_status = SyncStatus::NotSynced;
        self.last_synced_at = None;
        self.server_updated_at = None;
        self.sync_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SyncStatus::NotSynced,
            SyncStatus::Pending,
            SyncStatus::Synced,
            SyncStatus::Conflict,
            SyncStatus::Error,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn local_edit_keeps_first_base_value_per_field() {
        let mut entity = SyncableEntity::new(
            EntityType::Story,
            json!({ "title": "A", "body": "x" }),
            at(0),
        );
        entity.record_local_edit(json!({ "title": "B", "body": "x" }), at(10));
        entity.record_local_edit(json!({ "title": "C", "body": "y" }), at(20));

        let pending = entity.pending().unwrap();
        assert_eq!(pending.base.get("title"), Some(&json!("A")));
        assert_eq!(pending.base.get("body"), Some(&json!("x")));
        assert_eq!(entity.sync_status, SyncStatus::Pending);
        assert_eq!(entity.local_updated_at, at(20));
    }

    #[test]
    fn rebase_keeps_only_fields_changed_after_the_push() {
        let mut entity = SyncableEntity::new(
            EntityType::Story,
            json!({ "title": "A", "body": "x" }),
            at(0),
        );
        entity.record_local_edit(json!({ "title": "C", "body": "y" }), at(20));

        entity.rebase_pending(&json!({ "title": "B", "body": "y" }));

        let pending = entity.pending().unwrap();
        assert_eq!(pending.base.len(), 1);
        assert_eq!(pending.base.get("title"), Some(&json!("B")));
    }

    #[test]
    fn mark_synced_clears_pending_and_stamps_time() {
        let mut entity = SyncableEntity::new(EntityType::Hero, json!({ "name": "N" }), at(0));
        entity.record_local_edit(json!({ "name": "M" }), at(5));
        let remote = RemoteEntity {
            id: "srv".into(),
            updated_at: at(100),
            parent_id: None,
            data: json!({ "name": "M" }),
        };

        entity.mark_synced(&remote, at(50));

        assert_eq!(entity.sync_status, SyncStatus::Synced);
        assert!(entity.pending_changes.is_none());
        assert_eq!(entity.last_synced_at, Some(at(100)));
        assert_eq!(entity.server_id.as_deref(), Some("srv"));
    }
}
