//! API error mapping
//!
//! Every handler returns `Result<_, ApiError>`. The body is always
//! `{"detail": "..."}`; internal and configuration failures are logged with
//! a correlation id and surfaced as an opaque message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use parley_core::Error;

/// Wrapper turning [`parley_core::Error`] into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            Error::Validation(what) => (StatusCode::BAD_REQUEST, what.clone()),
            Error::NotFound(what) => (StatusCode::NOT_FOUND, what.clone()),
            // Never reveal whether the entity exists.
            Error::PermissionDenied => (StatusCode::FORBIDDEN, "permission denied".to_string()),
            Error::Timeout => (StatusCode::GATEWAY_TIMEOUT, "upstream timeout".to_string()),
            Error::Upstream(what) => (StatusCode::BAD_GATEWAY, what.clone()),
            Error::Cancelled => (StatusCode::CONFLICT, "operation cancelled".to_string()),
            Error::Config(what) => {
                let correlation_id = uuid::Uuid::new_v4();
                tracing::error!(%correlation_id, error = %what, "Configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("configuration error (ref {})", correlation_id),
                )
            }
            Error::Internal(what) => {
                let correlation_id = uuid::Uuid::new_v4();
                tracing::error!(%correlation_id, error = %what, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal error (ref {})", correlation_id),
                )
            }
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::PermissionDenied, StatusCode::FORBIDDEN),
            (Error::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (Error::Upstream("y".into()), StatusCode::BAD_GATEWAY),
            (
                Error::Internal("z".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_internal_detail_is_opaque() {
        let response = ApiError(Error::Internal("pool exhausted at db.rs:42".into()));
        let response = response.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // The detail carries a reference id, not the internal message; the
        // body itself is checked in integration, shape is enough here.
    }
}
