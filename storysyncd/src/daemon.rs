use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use storysync_core::{AuthClient, StoryClient};
use tracing::info;

use crate::cache::CacheStore;
use crate::config::SyncSettings;
use crate::migration::{MigrationOrchestrator, MigrationState, MigrationStateStore};
use crate::model::EntityType;
use crate::scheduler::{Scheduler, SyncTrigger};
use crate::storage::{Database, KvStore, MediaStore, SessionStore};
use crate::sync::backoff::Backoff;
use crate::sync::{ConflictResolver, DurableQueue, QueueStats, SyncEngine};
use crate::token_provider::TokenProvider;
use crate::transfer::BlobTransfer;

/// Fully wired engine plus the migration orchestrator sharing it.
pub struct DaemonRuntime {
    settings: SyncSettings,
    engine: Arc<SyncEngine>,
    migration: MigrationOrchestrator,
}

impl DaemonRuntime {
    pub async fn bootstrap(settings: SyncSettings) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&settings.media_dir)
            .await
            .with_context(|| format!("failed to create media dir at {:?}", settings.media_dir))?;
        let db = Database::open(&settings.database_path())
            .await
            .context("failed to open local database")?;
        let kv = KvStore::new(&db);

        let auth = AuthClient::with_base_url(&settings.auth_url, settings.client_id.clone())?;
        let tokens = TokenProvider::load(SessionStore::new(kv.clone()), Some(auth))
            .await
            .context("failed to load saved session")?;
        let queue = DurableQueue::open(kv.clone())
            .await
            .context("failed to load sync queue")?
            .with_max_retries(settings.max_retries)
            .with_backoff(Backoff::new(
                settings.backoff_base,
                settings.backoff_cap,
                true,
            ));
        let client = StoryClient::with_base_url(&settings.api_url, "")?;
        let engine = SyncEngine::new(
            client,
            CacheStore::new(&db),
            queue,
            tokens,
            MediaStore::new(settings.media_dir.clone()),
        )
        .with_resolver(ConflictResolver::new(settings.conflict_epsilon))
        .with_transfer(BlobTransfer::with_config(settings.transfer));
        let engine = Arc::new(engine);

        let migration =
            MigrationOrchestrator::load(Arc::clone(&engine), MigrationStateStore::new(kv)).await?;

        Ok(Self {
            settings,
            engine,
            migration,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn migration(&self) -> &MigrationOrchestrator {
        &self.migration
    }

    /// Runs the scheduler until Ctrl-C. Pending work is attempted right away.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            api_url = %self.settings.api_url,
            data_dir = %self.settings.data_dir.display(),
            interval_secs = self.settings.sync_interval.as_secs(),
            "storysyncd started"
        );
        let scheduler = Scheduler::new(Arc::clone(&self.engine))
            .with_interval(self.settings.sync_interval)
            .with_periodic_budget(self.settings.background_budget);
        scheduler.notify(SyncTrigger::Foreground);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let scheduler_handle = tokio::spawn(scheduler.run(async {
            let _ = stop_rx.await;
        }));

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        let _ = stop_tx.send(());
        scheduler_handle
            .await
            .context("scheduler task panicked")?;
        info!("storysyncd stopped");
        Ok(())
    }

    pub async fn status(&self) -> anyhow::Result<StatusSummary> {
        let cache = self.engine.cache();
        let mut entities = Vec::new();
        for kind in EntityType::ALL {
            let total = cache.count(kind).await?;
            let uploaded = cache.count_uploaded(kind).await?;
            entities.push((kind, total, uploaded));
        }
        Ok(StatusSummary {
            authenticated: self.engine.is_authenticated().await,
            entities,
            queue: self.engine.queue().statistics().await,
            migration: self.migration.state().await,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub authenticated: bool,
    /// `(kind, total, with server id)`.
    pub entities: Vec<(EntityType, u64, u64)>,
    pub queue: QueueStats,
    pub migration: MigrationState,
}

impl StatusSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "session: {}",
            if self.authenticated {
                "signed in"
            } else {
                "signed out"
            }
        );
        for (kind, total, uploaded) in &self.entities {
            let _ = writeln!(out, "{}: {total} local, {uploaded} on server", kind.as_str());
        }
        let _ = writeln!(
            out,
            "queue: {} pending, {} exhausted",
            self.queue.total, self.queue.exhausted
        );
        let _ = writeln!(
            out,
            "migration: {} at {} ({:.0}%)",
            status_label(&self.migration),
            self.migration.current_stage.as_str(),
            self.migration.progress * 100.0
        );
        if let Some(error) = &self.migration.error {
            let _ = writeln!(out, "migration error: {error}");
        }
        out
    }
}

fn status_label(state: &MigrationState) -> String {
    serde_json::to_value(state.status)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", state.status))
}
