use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.storysync.app";
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Validation,
    Conflict,
    NotFound,
    Transient,
}

/// Domain kinds mirrored between the device and the service of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Hero,
    Story,
    CustomEvent,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Hero, EntityType::Story, EntityType::CustomEvent];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Hero => "hero",
            EntityType::Story => "story",
            EntityType::CustomEvent => "custom_event",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hero" => Some(EntityType::Hero),
            "story" => Some(EntityType::Story),
            "custom_event" => Some(EntityType::CustomEvent),
            _ => None,
        }
    }

    fn collection(&self) -> &'static str {
        match self {
            EntityType::Hero => "heroes",
            EntityType::Story => "stories",
            EntityType::CustomEvent => "custom-events",
        }
    }
}

/// Server-side view of an entity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteEntity {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityWrite<'a> {
    pub data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<&'a str>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub expected_updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(RemoteEntity),
    /// The server saw a newer write than `expected_updated_at`.
    Conflict(RemoteEntity),
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    current: RemoteEntity,
}

#[derive(Debug, Deserialize)]
struct EntityListResponse {
    items: Vec<RemoteEntity>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignedUrl {
    pub href: Url,
    pub method: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
struct UploadLinkRequest<'a> {
    key: &'a str,
    content_type: &'a str,
}

#[derive(Clone)]
pub struct StoryClient {
    http: Client,
    base_url: Url,
    token: Arc<RwLock<String>>,
}

impl StoryClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: Arc::new(RwLock::new(token.into())),
        })
    }

    /// Replaces the bearer token used by this client and every clone of it.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(|err| err.into_inner());
        *guard = token.into();
    }

    pub async fn list_entities(&self, kind: EntityType) -> Result<Vec<RemoteEntity>, ApiError> {
        let url = self.endpoint(&format!("/v1/{}", kind.collection()))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let payload: EntityListResponse = Self::handle_response(response).await?;
        Ok(payload.items)
    }

    /// `idempotency_key` lets the server collapse a create that was retried
    /// after its response got lost.
    pub async fn create_entity(
        &self,
        kind: EntityType,
        body: &EntityWrite<'_>,
        idempotency_key: &str,
    ) -> Result<RemoteEntity, ApiError> {
        let url = self.endpoint(&format!("/v1/{}", kind.collection()))?;
        let response = self
            .authorized(self.http.post(url))
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_entity(
        &self,
        kind: EntityType,
        id: &str,
        body: &EntityWrite<'_>,
        force: bool,
    ) -> Result<UpdateOutcome, ApiError> {
        let mut url = self.entity_url(kind, id)?;
        if force {
            url.query_pairs_mut().append_pair("force", "true");
        }
        let response = self
            .authorized(self.http.put(url))
            .json(body)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<ConflictBody>(&text) {
                Ok(conflict) => Ok(UpdateOutcome::Conflict(conflict.current)),
                Err(_) => Err(ApiError::Api {
                    status,
                    body: text,
                    retry_after: None,
                }),
            };
        }
        Ok(UpdateOutcome::Applied(Self::handle_response(response).await?))
    }

    /// Deletes the remote copy. A missing entity counts as deleted.
    pub async fn delete_entity(&self, kind: EntityType, id: &str) -> Result<(), ApiError> {
        let url = self.entity_url(kind, id)?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    pub async fn media_upload_link(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<SignedUrl, ApiError> {
        let url = self.endpoint("/v1/media/upload-link")?;
        let response = self
            .authorized(self.http.post(url))
            .json(&UploadLinkRequest { key, content_type })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn media_download_link(&self, key: &str) -> Result<SignedUrl, ApiError> {
        let mut url = self.endpoint("/v1/media/download-link")?;
        url.query_pairs_mut().append_pair("key", key);
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn delete_media(&self, key: &str) -> Result<(), ApiError> {
        let mut url = self.endpoint("/v1/media")?;
        url.query_pairs_mut().append_pair("key", key);
        let response = self.authorized(self.http.delete(url)).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().unwrap_or_else(|err| err.into_inner());
        request.bearer_auth(token.as_str())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    fn entity_url(&self, kind: EntityType, id: &str) -> Result<Url, ApiError> {
        let mut url = self.endpoint(&format!("/v1/{}/", kind.collection()))?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        ApiError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl ApiError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            ApiError::Api { status, .. } => classify_api_status(*status),
            ApiError::Request(err) if err.is_decode() || err.is_builder() => {
                ApiErrorClass::Validation
            }
            ApiError::Request(_) => ApiErrorClass::Transient,
            ApiError::Url(_) => ApiErrorClass::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == ApiErrorClass::Transient
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::CONFLICT {
        ApiErrorClass::Conflict
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Validation
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::FORBIDDEN),
            ApiErrorClass::Validation
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Validation
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::CONFLICT),
            ApiErrorClass::Conflict
        );
    }

    #[test]
    fn parses_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn entity_type_round_trips_through_str() {
        for kind in EntityType::ALL {
            assert_eq!(EntityType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityType::parse("villain"), None);
    }
}
