//! API error type with XRPC-style JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("not implemented")]
    NotImplemented,

    #[error(transparent)]
    Index(#[from] lantern_index::IndexError),

    #[error(transparent)]
    Atproto(#[from] lantern_atproto::AtprotoError),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            ApiError::AuthRequired => (StatusCode::UNAUTHORIZED, "AuthenticationRequired"),
            ApiError::NotImplemented => (StatusCode::NOT_IMPLEMENTED, "NotImplemented"),
            ApiError::Atproto(lantern_atproto::AtprotoError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            ApiError::Atproto(lantern_atproto::AtprotoError::InvalidUri(_)) => {
                (StatusCode::BAD_REQUEST, "InvalidRequest")
            }
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UpstreamFailure"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": kind,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
