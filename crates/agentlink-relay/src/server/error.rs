//! HTTP error mapping for the stable wire codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use agentlink_core::db::DatabaseError;

use crate::auth::AuthError;
use crate::billing::BillingError;
use crate::protocol::ErrorCode;

/// An error ready to be rendered as an HTTP response body.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An opaque internal error; the detail goes to the log, not the wire.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        error!(detail = %detail, "Internal error");
        Self::new(ErrorCode::InternalError, "internal error")
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorCode::Unauthorized, "unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (status, body).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Internal(detail) => Self::internal(detail),
            other => Self::new(other.code(), other.to_string()),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::internal(e)
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        Self::internal(e)
    }
}
