use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::transfer::TransferConfig;

const DEFAULT_API_URL: &str = "https://api.storysync.app";
const DEFAULT_AUTH_URL: &str = "https://auth.storysync.app";
const DEFAULT_CLIENT_ID: &str = "storysyncd";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 3600;
const DEFAULT_MAX_RETRIES: u64 = 5;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 2;
const DEFAULT_BACKOFF_CAP_SECS: u64 = 300;
const DEFAULT_CONFLICT_EPSILON_MS: u64 = 1000;
const DEFAULT_BACKGROUND_BUDGET_SECS: u64 = 30;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub api_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub data_dir: PathBuf,
    pub media_dir: PathBuf,
    pub sync_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub conflict_epsilon: Duration,
    pub background_budget: Duration,
    pub transfer: TransferConfig,
}

impl SyncSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = match std::env::var("STORYSYNC_DATA_DIR") {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => dirs::data_dir()
                .context("data directory is unavailable")?
                .join("storysync"),
        };
        let media_dir = std::env::var("STORYSYNC_MEDIA_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("media"));

        Ok(Self {
            api_url: read_string_env("STORYSYNC_API_URL", DEFAULT_API_URL),
            auth_url: read_string_env("STORYSYNC_AUTH_URL", DEFAULT_AUTH_URL),
            client_id: read_string_env("STORYSYNC_CLIENT_ID", DEFAULT_CLIENT_ID),
            data_dir,
            media_dir,
            sync_interval: Duration::from_secs(read_u64_env(
                "STORYSYNC_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            max_retries: u32::try_from(read_u64_env(
                "STORYSYNC_MAX_RETRIES",
                DEFAULT_MAX_RETRIES,
            ))
            .unwrap_or(u32::MAX),
            backoff_base: Duration::from_secs(read_u64_env(
                "STORYSYNC_BACKOFF_BASE_SECS",
                DEFAULT_BACKOFF_BASE_SECS,
            )),
            backoff_cap: Duration::from_secs(read_u64_env(
                "STORYSYNC_BACKOFF_CAP_SECS",
                DEFAULT_BACKOFF_CAP_SECS,
            )),
            conflict_epsilon: Duration::from_millis(read_u64_env(
                "STORYSYNC_CONFLICT_EPSILON_MS",
                DEFAULT_CONFLICT_EPSILON_MS,
            )),
            background_budget: Duration::from_secs(read_u64_env(
                "STORYSYNC_BACKGROUND_BUDGET_SECS",
                DEFAULT_BACKGROUND_BUDGET_SECS,
            )),
            transfer: TransferConfig {
                upload_concurrency: read_usize_env(
                    "STORYSYNC_UPLOAD_CONCURRENCY",
                    DEFAULT_UPLOAD_CONCURRENCY,
                ),
                download_concurrency: read_usize_env(
                    "STORYSYNC_DOWNLOAD_CONCURRENCY",
                    DEFAULT_DOWNLOAD_CONCURRENCY,
                ),
            },
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("storysync.sqlite3")
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_usize_env(name: &str, default: u64) -> usize {
    usize::try_from(read_u64_env(name, default)).unwrap_or(1)
}

fn read_string_env(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}
