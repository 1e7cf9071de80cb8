//! Standardized error handling for API responses
//!
//! Provides consistent JSON error responses across all API endpoints. Error
//! codes follow the gRPC status names so clients can render
//! `code = <error> desc = <message>` uniformly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Standard API error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub status: u16,

    /// Error code for programmatic handling
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional detailed error information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Correlates the response with the server log line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Timestamp when error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            details: None,
            request_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// API error types with standardized responses
#[derive(Debug)]
pub enum ApiError {
    /// 500 Internal Server Error
    Internal(String),

    /// 404 Not Found
    NotFound(String),

    /// 401 Unauthorized
    AuthenticationFailed,

    /// 403 Forbidden
    PermissionDenied(String),

    /// 400 Bad Request
    BadRequest(String),

    /// 409 Conflict, key already taken
    AlreadyExists(String),

    /// 409 Conflict, concurrent modification or ambiguous address
    Conflict(String),

    /// 502 Bad Gateway, the remote cluster rejected or failed a call
    BadGateway(String),

    /// 504 Gateway Timeout
    GatewayTimeout(String),
}

impl ApiError {
    /// Convert error to ErrorResponse
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ApiError::Internal(msg) => {
                error!("Internal API error: {}", msg);
                ErrorResponse::new(500, "Internal", "An internal server error occurred")
                    .with_details(msg)
            }
            ApiError::NotFound(msg) => ErrorResponse::new(404, "NotFound", msg),
            ApiError::AuthenticationFailed => ErrorResponse::new(
                401,
                "Unauthenticated",
                "Authentication credentials are invalid or missing",
            ),
            ApiError::PermissionDenied(msg) => ErrorResponse::new(403, "PermissionDenied", msg),
            ApiError::BadRequest(msg) => ErrorResponse::new(400, "InvalidArgument", msg),
            ApiError::AlreadyExists(msg) => ErrorResponse::new(409, "AlreadyExists", msg),
            ApiError::Conflict(msg) => ErrorResponse::new(409, "FailedPrecondition", msg),
            ApiError::BadGateway(msg) => ErrorResponse::new(502, "Unavailable", msg),
            ApiError::GatewayTimeout(msg) => ErrorResponse::new(504, "DeadlineExceeded", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let error_response = self.to_error_response().with_request_id(&request_id);
        debug!(
            request_id = %request_id,
            status = error_response.status,
            error = %error_response.error,
            message = %error_response.message,
            "Request failed"
        );
        let status_code = StatusCode::from_u16(error_response.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status_code, Json(error_response)).into_response()
    }
}

impl From<shepherd_common::Error> for ApiError {
    fn from(err: shepherd_common::Error) -> Self {
        match err {
            shepherd_common::Error::InvalidConfig(msg) | shepherd_common::Error::Validation(msg) => {
                ApiError::BadRequest(msg)
            }
            shepherd_common::Error::System(msg) => ApiError::Internal(msg),
            shepherd_common::Error::Io(e) => ApiError::Internal(format!("I/O error: {}", e)),
            shepherd_common::Error::Serialization(e) => {
                ApiError::BadRequest(format!("Invalid JSON: {}", e))
            }
        }
    }
}
