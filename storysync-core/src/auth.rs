use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://auth.storysync.app";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("auth endpoint returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl AuthError {
    /// The refresh token itself was rejected; the session cannot be recovered.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            AuthError::Api { status, .. }
                if matches!(*status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
        )
    }
}

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
}

impl AuthClient {
    pub fn new(client_id: impl Into<String>) -> Result<Self, AuthError> {
        Self::with_base_url(DEFAULT_BASE_URL, client_id)
    }

    pub fn with_base_url(base_url: &str, client_id: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            client_id: client_id.into(),
        })
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<AuthToken, AuthError> {
        let url = self.base_url.join("/token")?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self.http.post(url).form(&form).send().await?;
        if response.status().is_success() {
            Ok(response.json::<AuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}
