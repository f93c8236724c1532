//! Error types for the authenticated client.

use reqwest::Method;
use std::time::Duration;
use thiserror::Error;

/// Boxed transport-level error source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for client operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Details of a 401 answer, kept so that every waiter of a failed
/// refresh wave can be rejected with its own original failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub method: Method,
    pub url: String,
    pub body: String,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} returned 401", self.method, self.url)?;
        if !self.body.is_empty() {
            write!(f, ": {}", self.body)?;
        }
        Ok(())
    }
}

/// Errors surfaced to callers of [`crate::ApiClient`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// The transport failed (DNS, connection refused, TLS, ...).
    #[error("network error: {0}")]
    Network(#[source] BoxError),

    /// The request did not complete within the transport timeout.
    #[error("request timed out")]
    Timeout,

    /// The backend rejected the credential and no refresh could fix it.
    #[error("unauthorized: {0}")]
    Unauthorized(AuthFailure),

    /// Non-success status, produced only by [`crate::ApiResponse::error_for_status`].
    #[error("HTTP error {status}: {body}")]
    Status { status: u16, body: String },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Request body could not be serialized.
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// Response body could not be deserialized.
    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),
}

impl ApiError {
    /// Wrap any transport error.
    pub fn network(err: impl Into<BoxError>) -> Self {
        Self::Network(err.into())
    }

    /// True when the backend answered 401 and the client gave up.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized(_) => Some(401),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(Box::new(err))
        }
    }
}

/// Why a refresh wave failed. Logged, never handed to callers: the
/// waiters receive their own [`AuthFailure`] instead.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Transport(#[source] ApiError),

    #[error("refresh endpoint returned {0}")]
    Status(u16),

    #[error("malformed refresh response: {0}")]
    Malformed(String),

    #[error("refresh did not complete within {0:?}")]
    TimedOut(Duration),
}

/// Errors from a key/value storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage contents are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("keychain error: {0}")]
    Keychain(String),

    #[error("no storage location available: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_display() {
        let failure = AuthFailure {
            method: Method::GET,
            url: "http://localhost/api/keywords".to_string(),
            body: "token expired".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "GET http://localhost/api/keywords returned 401: token expired"
        );
    }

    #[test]
    fn test_status() {
        let err = ApiError::Status {
            status: 503,
            body: String::new(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(ApiError::Timeout.status(), None);
        assert!(!ApiError::Cancelled.is_unauthorized());
    }
}
