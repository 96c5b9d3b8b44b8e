//! Caller identity injected by the upstream gateway.
//!
//! Authentication itself happens before requests reach this service; the
//! gateway forwards the authenticated user as an `X-User-Id` header.

use crate::error::AppError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Parse the user id header. `Ok(None)` when absent.
pub fn user_id_from_headers(headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    let raw = match headers.get(USER_ID_HEADER) {
        Some(value) => value,
        None => return Ok(None),
    };

    let raw = raw
        .to_str()
        .map_err(|_| AppError::Unauthorized("Malformed user id header".to_string()))?;

    Uuid::parse_str(raw.trim())
        .map(Some)
        .map_err(|_| AppError::Unauthorized(format!("Invalid user id: {}", raw)))
}

/// Caller that must be signed in (draft and pitch operations)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

/// Caller that may be anonymous (price reads)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaybeUser(pub Option<Uuid>);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_id_from_headers(&parts.headers)?
            .map(AuthenticatedUser)
            .ok_or_else(|| AppError::Unauthorized("Sign in to draft or pitch".to_string()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(user_id_from_headers(&parts.headers)?))
    }
}
