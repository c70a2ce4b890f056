mod database;
mod kv;
mod media;
mod session;

pub use database::Database;
pub use kv::KvStore;
pub use media::{MediaError, MediaStore, content_type_for};
pub use session::{AuthSession, SessionStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid entity type: {0}")]
    InvalidEntityType(String),
    #[error("invalid sync status: {0}")]
    InvalidStatus(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("unsupported version {found} for key {key} (expected {expected})")]
    UnsupportedVersion {
        key: String,
        found: u32,
        expected: u32,
    },
}
