use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::events::{ChannelError, PermissionErrorEvent};
use crate::notification::PresentationError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown assistant: {0}")]
    UnknownAssistant(String),

    #[error("no signed-in session")]
    Unauthorized,

    /// Raised by the development presenter and carried to the client as-is.
    #[error(transparent)]
    PermissionDenied(PermissionErrorEvent),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ChannelError> for AppError {
    fn from(err: ChannelError) -> Self {
        if let Some(PresentationError::PermissionDenied(event)) =
            err.raised().and_then(|e| e.downcast_ref::<PresentationError>())
        {
            return AppError::PermissionDenied(event.clone());
        }
        AppError::Internal(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                msg.clone(),
            ),
            AppError::UnknownAssistant(name) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "unknown_assistant",
                format!("no assistant named '{}'", name),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "no_session",
                "sign in to see notifications".to_string(),
            ),
            AppError::PermissionDenied(event) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "permission_denied",
                event.to_string(),
            ),
            AppError::Store(StoreError::NotFound(path)) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                format!("{} not found", path),
            ),
            AppError::Store(e) => {
                tracing::error!("Store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
