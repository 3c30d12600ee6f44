//! Request principal extraction
//!
//! Authentication itself happens upstream (gateway / load balancer); the
//! authenticated username reaches this process as the `x-parley-user`
//! header. The extractor validates the shape and hands handlers a trusted
//! owner string. Session-id ownership checks build on top of it.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use parley_core::{validate_username, SessionId};

/// Header carrying the authenticated principal.
pub const USER_HEADER: &str = "x-parley-user";

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl AuthUser {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a session id and verify its embedded owner token matches the
    /// caller. Bad shape is 400; a mismatch is 403 without revealing
    /// whether the session exists.
    pub fn owned_session(&self, raw: &str) -> Result<SessionId, crate::error::ApiError> {
        let id = SessionId::parse(raw)?;
        if id.owner() != self.0 {
            return Err(parley_core::Error::PermissionDenied.into());
        }
        Ok(id)
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or("");

        if value.is_empty() {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "missing authenticated user" })),
            ));
        }
        if validate_username(value).is_err() {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "invalid authenticated user" })),
            ));
        }

        Ok(AuthUser(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_session_checks_owner() {
        let user = AuthUser("alice".into());
        assert!(user.owned_session("sess_alice_0123abcd").is_ok());
        assert!(user.owned_session("sess_bob_0123abcd").is_err());
        assert!(user.owned_session("not-a-session").is_err());
    }
}
