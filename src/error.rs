use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("webhook signing is not configured")]
    SigningNotConfigured,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("storage error: {0}")]
    Storage(anyhow::Error),
    #[error("send failed: {0}")]
    Send(anyhow::Error),
}

impl InboxError {
    pub fn status(&self) -> StatusCode {
        match self {
            InboxError::InvalidSignature | InboxError::SigningNotConfigured => StatusCode::FORBIDDEN,
            InboxError::Malformed(_) => StatusCode::BAD_REQUEST,
            InboxError::Storage(_) | InboxError::Send(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for InboxError {
    fn into_response(self) -> Response {
        (self.status(), axum::Json(json!({"error": self.to_string()}))).into_response()
    }
}
