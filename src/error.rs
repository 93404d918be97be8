use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Field name -> message, as returned in 400 responses.
pub type FieldErrors = BTreeMap<String, String>;

/// API error taxonomy. Credential and reset-token failures are deliberately
/// generic on the wire so callers cannot tell which check failed.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed")]
    Validation(FieldErrors),
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Invalid or expired reset token")]
    TokenInvalid,
    #[error("{0}")]
    Conflict(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "success": false,
                    "message": "Validation failed",
                    "errors": errors,
                }),
            ),
            Self::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "message": "Invalid credentials" }),
            ),
            Self::TokenInvalid => (
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "message": "Invalid or expired reset token" }),
            ),
            Self::Conflict(msg) => (
                StatusCode::CONFLICT,
                json!({ "success": false, "message": msg }),
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "message": "Unauthorized" }),
            ),
            Self::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({ "success": false, "message": msg }),
            ),
            Self::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                json!({ "success": false, "message": msg }),
            ),
            Self::Internal(e) => {
                error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "message": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
