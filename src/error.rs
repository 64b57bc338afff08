use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Postgres SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("cannot start a dialog with yourself")]
    SelfDialog,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("blob storage error: {0}")]
    Blob(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn not_participant() -> Self {
        ChatError::Forbidden("not a participant of this conversation".to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::InvalidScope(_) | ChatError::SelfDialog | ChatError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Storage(_) | ChatError::Blob(_) | ChatError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::InvalidScope(_) => "INVALID_SCOPE",
            ChatError::SelfDialog => "SELF_DIALOG",
            ChatError::Conflict(_) => "CONFLICT",
            ChatError::BadRequest(_) => "BAD_REQUEST",
            ChatError::Storage(_) => "STORAGE_ERROR",
            ChatError::Blob(_) => "BLOB_ERROR",
            ChatError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return ChatError::Conflict(db.message().to_string());
            }
        }
        ChatError::Storage(e.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = Json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            ChatError::NotFound("message".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ChatError::not_participant().status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ChatError::SelfDialog.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ChatError::InvalidScope("everyone".into()).error_code(),
            "INVALID_SCOPE"
        );
        assert_eq!(
            ChatError::Storage("pool closed".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
