mod auth;
mod client;

pub use auth::{AuthClient, AuthError, AuthToken};
pub use client::{
    ApiError, ApiErrorClass, EntityType, EntityWrite, RemoteEntity, SignedUrl, StoryClient,
    UpdateOutcome,
};
