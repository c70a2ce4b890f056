use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::EntityType;
use crate::storage::{KvStore, StoreError};

const STATE_KEY: &str = "migration.state";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    #[default]
    Idle,
    Authenticating,
    Exporting,
    UploadingHeroes,
    UploadingStories,
    UploadingCustomEvents,
    UploadingMedia,
    Verifying,
    Finalizing,
    Complete,
}

impl MigrationStage {
    pub fn next(self) -> Self {
        match self {
            MigrationStage::Idle => MigrationStage::Authenticating,
            MigrationStage::Authenticating => MigrationStage::Exporting,
            MigrationStage::Exporting => MigrationStage::UploadingHeroes,
            MigrationStage::UploadingHeroes => MigrationStage::UploadingStories,
            MigrationStage::UploadingStories => MigrationStage::UploadingCustomEvents,
            MigrationStage::UploadingCustomEvents => MigrationStage::UploadingMedia,
            MigrationStage::UploadingMedia => MigrationStage::Verifying,
            MigrationStage::Verifying => MigrationStage::Finalizing,
            MigrationStage::Finalizing | MigrationStage::Complete => MigrationStage::Complete,
        }
    }

    /// Share of total progress this stage contributes once finished.
    pub fn weight(self) -> f64 {
        match self {
            MigrationStage::Exporting => 0.10,
            MigrationStage::UploadingHeroes => 0.25,
            MigrationStage::UploadingStories => 0.25,
            MigrationStage::UploadingCustomEvents => 0.05,
            MigrationStage::UploadingMedia => 0.10,
            MigrationStage::Verifying => 0.15,
            MigrationStage::Finalizing => 0.05,
            MigrationStage::Idle | MigrationStage::Authenticating | MigrationStage::Complete => 0.0,
        }
    }

    /// Progress reached when every stage before `self` is finished.
    pub fn progress_floor(self) -> f64 {
        let mut total = 0.0;
        let mut stage = MigrationStage::Idle;
        while stage < self {
            total += stage.weight();
            stage = stage.next();
        }
        total.min(1.0)
    }

    pub fn entity_type(self) -> Option<EntityType> {
        match self {
            MigrationStage::UploadingHeroes => Some(EntityType::Hero),
            MigrationStage::UploadingStories => Some(EntityType::Story),
            MigrationStage::UploadingCustomEvents => Some(EntityType::CustomEvent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStage::Idle => "idle",
            MigrationStage::Authenticating => "authenticating",
            MigrationStage::Exporting => "exporting",
            MigrationStage::UploadingHeroes => "uploading_heroes",
            MigrationStage::UploadingStories => "uploading_stories",
            MigrationStage::UploadingCustomEvents => "uploading_custom_events",
            MigrationStage::UploadingMedia => "uploading_media",
            MigrationStage::Verifying => "verifying",
            MigrationStage::Finalizing => "finalizing",
            MigrationStage::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationItemKind {
    Hero,
    Story,
    CustomEvent,
    Media,
}

impl From<EntityType> for MigrationItemKind {
    fn from(value: EntityType) -> Self {
        match value {
            EntityType::Hero => MigrationItemKind::Hero,
            EntityType::Story => MigrationItemKind::Story,
            EntityType::CustomEvent => MigrationItemKind::CustomEvent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MigrationState {
    pub status: MigrationStatus,
    pub current_stage: MigrationStage,
    pub progress: f64,
    #[serde(default)]
    pub exported: BTreeMap<MigrationItemKind, u64>,
    #[serde(default)]
    pub uploaded: BTreeMap<MigrationItemKind, u64>,
    /// Media keys already on the server.
    #[serde(default)]
    pub uploaded_media: BTreeSet<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MigrationState {
    pub fn exported_count(&self, kind: MigrationItemKind) -> u64 {
        self.exported.get(&kind).copied().unwrap_or(0)
    }

    pub fn uploaded_count(&self, kind: MigrationItemKind) -> u64 {
        self.uploaded.get(&kind).copied().unwrap_or(0)
    }

    /// Never moves progress backwards.
    pub fn advance_progress(&mut self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        if value > self.progress {
            self.progress = value;
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            MigrationStatus::Failed | MigrationStatus::InProgress
        ) && self.current_stage != MigrationStage::Complete
    }
}

/// Single persisted migration record.
#[derive(Clone)]
pub struct MigrationStateStore {
    kv: KvStore,
}

impl MigrationStateStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub async fn load(&self) -> Result<MigrationState, StoreError> {
        Ok(self
            .kv
            .load_versioned(STATE_KEY, STATE_VERSION)
            .await?
            .unwrap_or_default())
    }

    pub async fn save(&self, state: &MigrationState) -> Result<(), StoreError> {
        self.kv
            .store_versioned(STATE_KEY, STATE_VERSION, state)
            .await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.kv.delete(STATE_KEY).await
    }
}
