//! Request authentication
//!
//! This service sits behind the platform gateway, which terminates
//! sessions and forwards the authenticated user id in the `x-user-id`
//! header. The extractor trusts that header; it is the deployment's
//! job to keep this service off the public network except for the
//! webhook route.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::error::ApiError;

/// The authenticated user forwarded by the gateway
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(ApiError::Unauthorized)?;

        Ok(AuthUser { user_id })
    }
}
