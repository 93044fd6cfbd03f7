//! Error codes and the gateway error type.
//!
//! [`ErrorCode`] is the closed set of codes that can appear on the wire.
//! [`GatewayError`] is what handlers and the orchestrator return; the router
//! turns it into an `error` frame via [`GatewayError::to_payload`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Machine-readable error code carried in `error` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing, malformed or expired credential, or message before handshake.
    AuthenticationFailed,
    /// Caller is authenticated but does not own the referenced resource.
    AuthorizationFailed,
    /// Malformed frame, stale timestamp, bad payload shape or unknown type.
    InvalidMessage,
    /// Backend call exceeded its deadline.
    Timeout,
    /// Request budget for the client key is exhausted.
    RateLimited,
    /// Unexpected server-side failure.
    InternalError,
    /// Referenced session is missing or expired.
    SessionExpired,
    /// Referenced patient does not exist.
    PatientNotFound,
    /// Storage layer failure.
    DatabaseError,
    /// Agent backend failed or is unavailable.
    AiServiceError,
}

impl ErrorCode {
    /// Whether a client may retry the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::InternalError | Self::AiServiceError
        )
    }

    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AuthorizationFailed => "AUTHORIZATION_FAILED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::PatientNotFound => "PATIENT_NOT_FOUND",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::AiServiceError => "AI_SERVICE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to clients as `error` frames.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Handshake or credential failure.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Resource belongs to someone else.
    #[error("not authorized: {0}")]
    AuthorizationFailed(String),

    /// Client input rejected before dispatch.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Backend deadline exceeded.
    #[error("query timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },

    /// Rate limit exhausted.
    #[error("rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds until the exhausted window resets.
        retry_after_ms: u64,
    },

    /// Session missing or expired.
    #[error("session not found or expired: {0}")]
    SessionExpired(String),

    /// Patient lookup failed.
    #[error("patient not found: {0}")]
    PatientNotFound(String),

    /// Storage failure.
    #[error("database error: {0}")]
    Database(String),

    /// Agent backend failure.
    #[error("agent service error: {0}")]
    AiService(String),

    /// Anything unexpected. The text is logged, never sent.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::AuthorizationFailed(_) => ErrorCode::AuthorizationFailed,
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::SessionExpired(_) => ErrorCode::SessionExpired,
            Self::PatientNotFound(_) => ErrorCode::PatientNotFound,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::AiService(_) => ErrorCode::AiServiceError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the client may retry.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Message safe to show to a client.
    ///
    /// Internal and storage errors are replaced by a generic sentence so
    /// nothing about the server's internals leaks.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_owned(),
            Self::Database(_) => "storage temporarily unavailable".to_owned(),
            other => other.to_string(),
        }
    }

    /// Build the payload of an `error` frame.
    pub fn to_payload(&self) -> Value {
        let mut body = json!({
            "code": self.code(),
            "message": self.client_message(),
            "retryable": self.is_retryable(),
        });
        if let Self::RateLimited { retry_after_ms } = self {
            body["details"] = json!({ "retryAfterMs": retry_after_ms });
        }
        if let Self::Timeout { timeout_ms } = self {
            body["details"] = json!({ "timeoutMs": timeout_ms });
        }
        body
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}

/// Result alias used across the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;
