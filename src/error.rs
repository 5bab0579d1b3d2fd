use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::persistence::PersistenceError;

/// Application-wide error types with appropriate HTTP status codes.
///
/// Errors raised while the access-control layer evaluates a request never
/// reach this type's `IntoResponse`: that layer resolves failures locally
/// (fail-open or log-and-continue). `AppError` is what the admin API,
/// dashboard handlers and startup code propagate.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for API endpoints.
///
/// The same `{error, message}` shape is used by the access-control layer
/// for its 403/429 denials.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::Persistence(PersistenceError::Timeout(_)) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "The security datastore did not respond in time. Please try again.",
            ),
            AppError::Persistence(PersistenceError::Duplicate) => (
                StatusCode::CONFLICT,
                "conflict",
                "The record already exists.",
            ),
            AppError::Persistence(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "persistence_unavailable",
                "The security datastore is temporarily unavailable. Please try again later.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),
            AppError::InvalidBody(rejection) => {
                return (
                    rejection.status(),
                    axum::Json(ErrorResponse {
                        error: "invalid_body".to_string(),
                        message: rejection.body_text(),
                    }),
                )
                    .into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
