use crate::services::error::{AuthError, ServiceError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::fmt;

/// Error returned by handlers; renders as a JSON body with a stable `code`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// Extra top-level fields merged into the JSON body.
    pub details: Option<Map<String, Value>>,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            details: None,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{} ({}): {}", self.status, self.code, self.message);
        }

        let mut body = self.details.unwrap_or_default();
        body.insert("error".into(), json!(self.message));
        body.insert("code".into(), json!(self.code));
        body.insert("status".into(), json!(self.status.as_u16()));

        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let (status, code) = match err {
            AuthError::Missing => (StatusCode::UNAUTHORIZED, "missing_token"),
            AuthError::Invalid => (StatusCode::FORBIDDEN, "invalid_token"),
            AuthError::Expired => (StatusCode::FORBIDDEN, "token_expired"),
            AuthError::BadCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
        };
        AppError::new(status, code, err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::Validation(_) => AppError::bad_request(message),
            ServiceError::NotFound(_) => AppError::not_found(message),
            ServiceError::Conflict(_) => AppError::new(StatusCode::CONFLICT, "conflict", message),
            ServiceError::StorageWrite { .. } => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_write_failed", message)
                    .with_detail("objectStored", false)
            }
            ServiceError::StorageRead { .. } => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_read_failed", message)
            }
            ServiceError::IndexWrite {
                filename,
                object_stored,
                ..
            } => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "index_write_failed", message)
                    .with_detail("objectStored", object_stored)
                    .with_detail("filename", filename)
            }
            ServiceError::Auth(auth) => auth.into(),
            ServiceError::Database(_) | ServiceError::Internal(_) => AppError::internal(message),
        }
    }
}
