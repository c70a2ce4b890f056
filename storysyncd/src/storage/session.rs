use serde::{Deserialize, Serialize};
use storysync_core::AuthToken;

use super::{KvStore, StoreError};
use crate::clock;

const SESSION_KEY: &str = "auth.session";
const SESSION_VERSION: u32 = 1;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: Option<i64>,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AuthSession {
    pub fn from_auth_token(token: &AuthToken) -> Self {
        let expires_at = token.expires_in.map(|secs| {
            clock::now()
                .unix_timestamp()
                .saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))
        });
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at,
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    kv: KvStore,
}

impl SessionStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub async fn load(&self) -> Result<Option<AuthSession>, StoreError> {
        self.kv.load_versioned(SESSION_KEY, SESSION_VERSION).await
    }

    pub async fn save(&self, session: &AuthSession) -> Result<(), StoreError> {
        self.kv
            .store_versioned(SESSION_KEY, SESSION_VERSION, session)
            .await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.kv.delete(SESSION_KEY).await
    }
}
