//! Application error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    /// Connecting to or probing a target database failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The native driver rejected a statement
    #[error("Query error: {0}")]
    Query(String),

    /// Unsupported engine, malformed config, or malformed job payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// A job handler failed
    #[error("Job execution error: {0}")]
    JobExecution(String),

    /// A live channel write failed. Never propagated past the hub.
    #[error("Notification delivery error: {0}")]
    NotificationDelivery(String),

    /// The job was cancelled while it was running
    #[error("Job {0} was cancelled")]
    JobCancelled(Uuid),

    /// Internal store failure
    #[error("Database error: {0}")]
    Database(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::JobCancelled(_) => StatusCode::CONFLICT,
            AppError::Connection(_) | AppError::Query(_) => StatusCode::BAD_GATEWAY,
            AppError::JobExecution(_)
            | AppError::NotificationDelivery(_)
            | AppError::Database(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let resp = AppError::Validation("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::NotFound("job".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = AppError::Connection("refused".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_json_error_is_validation() {
        let err: AppError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
