// Error handling module
// Defines error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Why a renewal cycle failed
///
/// Cloned to every request queued behind the failed renewal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    /// Nothing to renew with
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// Renewal endpoint answered with a non-2xx status
    #[error("Refresh rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Renewal request never got an answer
    #[error("Refresh request failed: {0}")]
    Network(String),

    /// Renewal endpoint answered 2xx with an unusable body
    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Renewed tokens could not be persisted
    #[error("Credential store error: {0}")]
    Store(String),
}

/// Errors surfaced by the authenticated transport and session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// Unrecoverable token rejection outside a browser tab
    /// The page guard turns this into a redirect to the guest view
    #[error("Authentication token error")]
    AuthToken,

    /// Unrecoverable token rejection inside a tab (already signed out)
    #[error("Unauthorized: {}", .code.as_deref().unwrap_or("no error code"))]
    Unauthorized { code: Option<String> },

    /// Token renewal failed for the cycle this request was queued on
    #[error("Token renewal failed: {0}")]
    Renewal(#[from] RenewalError),

    /// Non-401 error status from the API
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Successful status with a body we could not use
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// Build an API error, truncating the body to keep logs readable
    pub fn api(status: u16, body: &str) -> Self {
        SessionError::Api {
            status,
            message: truncate_body(body),
        }
    }

    /// True for failures that mean the session is gone
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SessionError::AuthToken
                | SessionError::Unauthorized { .. }
                | SessionError::Renewal(_)
        )
    }
}

/// Truncate a response body to avoid logging excessive data
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }

    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            SessionError::AuthToken => (
                StatusCode::UNAUTHORIZED,
                "auth_token_error",
                "Authentication token error".to_string(),
            ),
            SessionError::Unauthorized { code } => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                format!(
                    "Unauthorized: {}",
                    code.as_deref().unwrap_or("no error code")
                ),
            ),
            SessionError::Renewal(err) => {
                (StatusCode::UNAUTHORIZED, "renewal_error", err.to_string())
            }
            SessionError::Api { status, message } => {
                let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                (status_code, "api_error", message)
            }
            SessionError::Http(err) => {
                tracing::error!("Upstream request failed: {:?}", err);
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "Upstream request failed".to_string(),
                )
            }
            SessionError::InvalidResponse(msg) => (StatusCode::BAD_GATEWAY, "invalid_response", msg),
            SessionError::Internal(err) => {
                // Log internal errors
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
