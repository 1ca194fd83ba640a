//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
///
/// The body is `{"error": <message>, "code": <code>}`. Store and publish
/// failures share a 500 status but carry different codes, because a failed
/// publish leaves an orphaned order behind.
#[derive(Debug)]
pub enum ApiError {
    /// The request body was unreadable or failed validation.
    BadRequest(String),
    /// The order could not be persisted.
    StoreUnavailable(String),
    /// The order was persisted but its creation event was not published.
    OrderOrphaned(String),
    /// Anything else.
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::StoreUnavailable(_)
            | ApiError::OrderOrphaned(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::StoreUnavailable(_) => "store_unavailable",
            ApiError::OrderOrphaned(_) => "order_orphaned",
            ApiError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::StoreUnavailable(msg)
            | ApiError::OrderOrphaned(msg)
            | ApiError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self.message(), "order creation failed");
        }

        let body = serde_json::json!({ "error": self.message(), "code": self.code() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        match &err {
            SagaError::Validation(_) => ApiError::BadRequest(err.to_string()),
            SagaError::Store(_) => ApiError::StoreUnavailable(err.to_string()),
            SagaError::OrderOrphaned { .. } | SagaError::Publish(_) => {
                ApiError::OrderOrphaned(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
