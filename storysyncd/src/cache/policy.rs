use storysync_core::{ApiError, RemoteEntity, StoryClient};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::CacheStore;
use crate::clock;
use crate::model::{EntityType, SyncStatus, SyncableEntity};
use crate::storage::StoreError;
use crate::sync::conflict::{ConflictDecision, ConflictResolver};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
}

/// Where a read is allowed to get its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    CacheOnly,
    NetworkOnly,
    /// Cache if it has anything for the kind, network otherwise.
    #[default]
    CacheFirst,
    /// Network, falling back to cache when the request fails.
    NetworkFirst,
    /// Cache now, plus a background refresh.
    CacheAndNetwork,
}

pub struct CachedRead {
    pub entities: Vec<SyncableEntity>,
    pub refresh: Option<JoinHandle<Result<Vec<SyncableEntity>, CacheError>>>,
}

impl CachedRead {
    fn ready(entities: Vec<SyncableEntity>) -> Self {
        Self {
            entities,
            refresh: None,
        }
    }
}

/// Read path over the cache store that may also pull from the service.
#[derive(Clone)]
pub struct CachedReader {
    store: CacheStore,
    client: StoryClient,
    resolver: ConflictResolver,
}

impl CachedReader {
    pub fn new(store: CacheStore, client: StoryClient) -> Self {
        Self {
            store,
            client,
            resolver: ConflictResolver::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub async fn fetch_all(
        &self,
        kind: EntityType,
        policy: CachePolicy,
    ) -> Result<CachedRead, CacheError> {
        match policy {
            CachePolicy::CacheOnly => Ok(CachedRead::ready(self.store.fetch_all(kind).await?)),
            CachePolicy::NetworkOnly => Ok(CachedRead::ready(self.refresh(kind).await?)),
            CachePolicy::CacheFirst => {
                let cached = self.store.fetch_all(kind).await?;
                if !cached.is_empty() {
                    return Ok(CachedRead::ready(cached));
                }
                Ok(CachedRead::ready(self.refresh(kind).await?))
            }
            CachePolicy::NetworkFirst => match self.refresh(kind).await {
                Ok(entities) => Ok(CachedRead::ready(entities)),
                Err(CacheError::Api(err)) => {
                    warn!(
                        entity_type = kind.as_str(),
                        error = %err,
                        "network read failed; serving cache"
                    );
                    Ok(CachedRead::ready(self.store.fetch_all(kind).await?))
                }
                Err(err) => Err(err),
            },
            CachePolicy::CacheAndNetwork => {
                let cached = self.store.fetch_all(kind).await?;
                let reader = self.clone();
                let refresh = tokio::spawn(async move { reader.refresh(kind).await });
                Ok(CachedRead {
                    entities: cached,
                    refresh: Some(refresh),
                })
            }
        }
    }

    /// Pulls the remote listing for `kind` into the cache. Entities with
    /// unsent local edits go through the conflict resolver first.
    pub async fn refresh(&self, kind: EntityType) -> Result<Vec<SyncableEntity>, CacheError> {
        let remote_items = self.client.list_entities(kind).await?;
        let mut applied = 0usize;
        for remote in &remote_items {
            if self.reconcile_remote(kind, remote).await? {
                applied += 1;
            }
        }
        info!(
            entity_type = kind.as_str(),
            remote = remote_items.len(),
            applied,
            "cache refreshed"
        );
        Ok(self.store.fetch_all(kind).await?)
    }

    async fn reconcile_remote(
        &self,
        kind: EntityType,
        remote: &RemoteEntity,
    ) -> Result<bool, CacheError> {
        let now = clock::now();
        let Some(mut local) = self.store.fetch_by_server_id(kind, &remote.id).await? else {
            let mut entity = SyncableEntity::new(kind, remote.data.clone(), now);
            entity.parent_id = self.local_parent_id(remote).await?;
            entity.apply_remote(remote, now);
            self.store.save(&entity).await?;
            debug!(
                entity_type = kind.as_str(),
                server_id = %remote.id,
                local_id = %entity.local_id,
                "remote entity cached"
            );
            return Ok(true);
        };

        match self.resolver.reconcile(&local, remote) {
            ConflictDecision::NoOp | ConflictDecision::KeepLocalPush => Ok(false),
            ConflictDecision::AcceptRemote => {
                local.apply_remote(remote, now);
                if let Some(parent) = self.local_parent_id(remote).await? {
                    local.parent_id = Some(parent);
                }
                self.store.save(&local).await?;
                Ok(true)
            }
            ConflictDecision::Merge(merged) => {
                self.store.save(&merged).await?;
                Ok(true)
            }
            ConflictDecision::ConflictUnresolved => {
                warn!(
                    entity_type = kind.as_str(),
                    local_id = %local.local_id,
                    "unresolved conflict while refreshing cache"
                );
                self.store
                    .mark_for_sync(&mut local, SyncStatus::Conflict)
                    .await?;
                Ok(true)
            }
        }
    }

    /// Stories point at their hero by server id remotely and by local id here.
    async fn local_parent_id(&self, remote: &RemoteEntity) -> Result<Option<String>, CacheError> {
        let Some(parent_server_id) = remote.parent_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .store
            .fetch_by_server_id(EntityType::Hero, parent_server_id)
            .await?
            .map(|hero| hero.local_id))
    }
}
