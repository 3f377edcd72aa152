//! Errors returned by route handlers.

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use tracing::error;

use recorder_common::protocol::ErrorResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request was malformed; nothing was written.
    #[error("{1}")]
    Rejected(StatusCode, String),
    /// Disk or database failure. The cause is logged, never returned.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::Rejected(StatusCode::BAD_REQUEST, msg.into())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::Rejected(e.status(), e.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        ApiError::Rejected(e.status(), e.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Rejected(e.status(), e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Rejected(status, msg) => (status, msg),
            ApiError::Internal(e) => {
                error!("Request failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}
