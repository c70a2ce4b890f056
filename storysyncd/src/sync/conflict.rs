use std::time::Duration;

use serde_json::Value;
use storysync_core::RemoteEntity;

use crate::model::{PendingChanges, SyncableEntity};

const DEFAULT_EPSILON: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictDecision {
    NoOp,
    KeepLocalPush,
    AcceptRemote,
    /// Both sides changed, but on disjoint fields. The entity carries the
    /// combined payload and still has to be pushed.
    Merge(SyncableEntity),
    ConflictUnresolved,
}

impl ConflictDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictDecision::NoOp => "no_op",
            ConflictDecision::KeepLocalPush => "keep_local_push",
            ConflictDecision::AcceptRemote => "accept_remote",
            ConflictDecision::Merge(_) => "merge",
            ConflictDecision::ConflictUnresolved => "conflict_unresolved",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    epsilon: Duration,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

impl ConflictResolver {
    pub fn new(epsilon: Duration) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> Duration {
        self.epsilon
    }

    pub fn reconcile(&self, local: &SyncableEntity, remote: &RemoteEntity) -> ConflictDecision {
        let remote_is_newer = local
            .last_synced_at
            .is_none_or(|synced| remote.updated_at > synced);

        let Some(pending) = local.pending() else {
            return if remote_is_newer {
                ConflictDecision::AcceptRemote
            } else {
                ConflictDecision::NoOp
            };
        };

        if !remote_is_newer {
            return ConflictDecision::KeepLocalPush;
        }

        if let Some(merged) = merge_disjoint(local, &pending, remote) {
            return ConflictDecision::Merge(merged);
        }

        let delta = local.local_updated_at - remote.updated_at;
        if delta.unsigned_abs() <= self.epsilon {
            ConflictDecision::ConflictUnresolved
        } else if delta.is_positive() {
            ConflictDecision::KeepLocalPush
        } else {
            ConflictDecision::AcceptRemote
        }
    }
}

/// Remote data with the locally edited fields laid on top, provided the
/// remote side left every one of those fields at its base value.
fn merge_disjoint(
    local: &SyncableEntity,
    pending: &PendingChanges,
    remote: &RemoteEntity,
) -> Option<SyncableEntity> {
    if pending.base.is_empty() {
        return None;
    }
    let (Value::Object(local_fields), Value::Object(remote_fields)) =
        (&local.payload, &remote.data)
    else {
        return None;
    };

    for (field, base) in &pending.base {
        let remote_value = remote_fields.get(field).unwrap_or(&Value::Null);
        if remote_value != base {
            return None;
        }
    }

    let mut fields = remote_fields.clone();
    for field in pending.base.keys() {
        match local_fields.get(field) {
            Some(value) => {
                fields.insert(field.clone(), value.clone());
            }
            None => {
                fields.remove(field);
            }
        }
    }

    let mut merged = local.clone();
    merged.payload = Value::Object(fields);
    merged.server_id = Some(remote.id.clone());
    merged.server_updated_at = Some(remote.updated_at);
    merged.last_synced_at = Some(remote.updated_at);
    Some(merged)
}
