//! JSON error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::jobs::ProducerError;

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Errors surfaced by the HTTP layer. Messages never carry internal detail.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    ServiceUnavailable,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => {
                json_error(StatusCode::UNAUTHORIZED, "unauthorized", "Missing or invalid token")
            }
            ApiError::Forbidden => {
                json_error(StatusCode::FORBIDDEN, "forbidden", "Requires admin role")
            }
            ApiError::ServiceUnavailable => json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "Export service not available",
            ),
            ApiError::Internal => json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to process export request",
            ),
        }
    }
}

impl From<ProducerError> for ApiError {
    fn from(err: ProducerError) -> Self {
        match err {
            ProducerError::ServiceUnavailable(_) => ApiError::ServiceUnavailable,
            other => {
                error!(error = %other, "Export request failed");
                ApiError::Internal
            }
        }
    }
}
