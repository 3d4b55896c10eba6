use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

use crate::producer::{EnqueueError, ValidationError};
use crate::progress::ProgressError;
use crate::storage::StorageError;

/// Error returned by every route. Rendered as `{error, code}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(e) => e.code(),
            ApiError::BadRequest { code, .. } => code,
            ApiError::NotFound(_) => "NotFound",
            ApiError::Unavailable(_) => "StoreUnavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let payload = json!({ "error": self.to_string(), "code": self.code() });
        (status, Json(payload)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!(error = %e, "Store operation failed");
        ApiError::Unavailable(e.to_string())
    }
}

impl From<ProgressError> for ApiError {
    fn from(e: ProgressError) -> Self {
        match e {
            ProgressError::Storage(e) => e.into(),
            e @ ProgressError::BatchTooLarge { .. } => {
                ApiError::bad_request("BatchTooLarge", e.to_string())
            }
            other => ApiError::bad_request("InvalidProgress", other.to_string()),
        }
    }
}

impl From<EnqueueError> for ApiError {
    fn from(e: EnqueueError) -> Self {
        match e {
            EnqueueError::Validation(e) => e.into(),
            EnqueueError::Storage(e) => e.into(),
            EnqueueError::Progress(e) => e.into(),
        }
    }
}
