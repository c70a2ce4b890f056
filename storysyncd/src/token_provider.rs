use storysync_core::{AuthClient, AuthError};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock;
use crate::storage::{AuthSession, SessionStore, StoreError};

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("auth client is required to refresh expired token")]
    MissingAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("token refresh failed: {0}")]
    Auth(#[from] AuthError),
    #[error("session storage error: {0}")]
    Store(#[from] StoreError),
}

/// Owns the persisted session and keeps its access token fresh.
pub struct TokenProvider {
    session: Option<AuthSession>,
    auth_client: Option<AuthClient>,
    store: SessionStore,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub async fn load(
        store: SessionStore,
        auth_client: Option<AuthClient>,
    ) -> Result<Self, TokenProviderError> {
        let session = store.load().await?;
        Ok(Self {
            session,
            auth_client,
            store,
            refresh_skew_secs: 60,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&AuthSession> {
        self.session.as_ref()
    }

    pub async fn sign_in(&mut self, session: AuthSession) -> Result<(), TokenProviderError> {
        self.store.save(&session).await?;
        self.session = Some(session);
        info!("session stored");
        Ok(())
    }

    pub async fn sign_out(&mut self) -> Result<(), TokenProviderError> {
        self.store.clear().await?;
        if self.session.take().is_some() {
            warn!("session signed out");
        }
        Ok(())
    }

    pub async fn valid_access_token(&mut self) -> Result<String, TokenProviderError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        self.session
            .as_ref()
            .map(|session| session.access_token.clone())
            .ok_or(TokenProviderError::NotAuthenticated)
    }

    pub async fn refresh_now(&mut self) -> Result<String, TokenProviderError> {
        self.refresh().await?;
        self.session
            .as_ref()
            .map(|session| session.access_token.clone())
            .ok_or(TokenProviderError::NotAuthenticated)
    }

    fn should_refresh(&self) -> bool {
        let Some(expires_at) = self.session.as_ref().and_then(|s| s.expires_at) else {
            return false;
        };
        expires_at
            <= clock::now()
                .unix_timestamp()
                .saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&mut self) -> Result<(), TokenProviderError> {
        let session = self
            .session
            .as_ref()
            .ok_or(TokenProviderError::NotAuthenticated)?;
        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or(TokenProviderError::MissingRefreshToken)?;
        let client = self
            .auth_client
            .as_ref()
            .ok_or(TokenProviderError::MissingAuthClient)?;
        let token = client.refresh_token(&refresh_token).await?;
        let mut refreshed = AuthSession::from_auth_token(&token);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        self.store.save(&refreshed).await?;
        self.session = Some(refreshed);
        info!("access token refreshed");
        Ok(())
    }
}
