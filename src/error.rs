// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the profile sync engine.
//!
//! Every failure carries a closed [`ErrorKind`] assigned where the error is
//! created (or at the first catch boundary), so retry and circuit logic
//! dispatch on the kind instead of inspecting messages.
//!
//! # Error Categories
//!
//! | Kind | Retryable | Description |
//! |------|-----------|-------------|
//! | `NetworkUnavailable` | Yes | Device offline, connection refused or reset |
//! | `Timeout` | Yes | Call exceeded the tier-derived timeout |
//! | `ServerError` | Yes | Upstream 5xx / transient backend failure |
//! | `ValidationError` | No | Malformed input or payload |
//! | `AuthenticationError` | No | Wallet session not authorized |
//! | `UserRejected` | No | User declined the wallet prompt |
//! | `InsufficientFunds` | No | Wallet cannot cover the mutation |
//! | `StorageError` | No | Local durable storage failed (degraded, never fatal) |
//! | `CircuitOpen` | No | Synthetic fast-fail, operation not invoked |
//! | `NotFound` | No | Requested record does not exist |
//! | `InvalidState` | No | Orchestrator state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! `SyncError` is `Clone` so one in-flight result can be handed to every
//! caller that joined it.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Type alias for boxed async futures (keeps collaborator traits object-safe).
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'a>>;

/// Closed classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkUnavailable,
    Timeout,
    ServerError,
    ValidationError,
    AuthenticationError,
    UserRejected,
    InsufficientFunds,
    StorageError,
    CircuitOpen,
    NotFound,
    InvalidState,
    Internal,
}

impl ErrorKind {
    /// Whether failures of this kind are worth retrying with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable | Self::Timeout | Self::ServerError
        )
    }

    /// Whether this kind means the device or endpoint is unreachable.
    ///
    /// Mutations failing this way are deferred to the offline queue.
    pub fn is_connectivity(self) -> bool {
        matches!(self, Self::NetworkUnavailable | Self::Timeout)
    }

    /// Stable label for logs, metrics and event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "network_unavailable",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::ValidationError => "validation_error",
            Self::AuthenticationError => "authentication_error",
            Self::UserRejected => "user_rejected",
            Self::InsufficientFunds => "insufficient_funds",
            Self::StorageError => "storage_error",
            Self::CircuitOpen => "circuit_open",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while synchronizing wallet state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The device is offline or the endpoint refused the connection.
    #[error("Network unavailable ({operation}): {message}")]
    NetworkUnavailable { operation: String, message: String },

    /// The call exceeded its deadline.
    #[error("Timeout ({operation}) after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Upstream returned a transient server failure.
    #[error("Server error ({operation}): {message}")]
    Server { operation: String, message: String },

    /// Input or payload failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The wallet session is not authorized.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The user declined the wallet request.
    #[error("User rejected request: {0}")]
    UserRejected(String),

    /// The wallet cannot cover the mutation.
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Local durable storage failed.
    #[error("Storage error ({operation}): {message}")]
    Storage { operation: String, message: String },

    /// The circuit for this endpoint is open; the operation was not invoked.
    #[error("circuit open: {endpoint}")]
    CircuitOpen { endpoint: String },

    /// The requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted in the wrong orchestrator state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn server(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn circuit_open(endpoint: impl Into<String>) -> Self {
        Self::CircuitOpen {
            endpoint: endpoint.into(),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkUnavailable { .. } => ErrorKind::NetworkUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Server { .. } => ErrorKind::ServerError,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Authentication(_) => ErrorKind::AuthenticationError,
            Self::UserRejected(_) => ErrorKind::UserRejected,
            Self::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            Self::Storage { .. } => ErrorKind::StorageError,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Check if this error is a circuit breaker fast-fail.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        Self::storage("sqlite", e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("serialization: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_kinds() {
        assert!(SyncError::network("get_ownership", "connection reset").is_retryable());
        assert!(SyncError::timeout("get_ownership", Duration::from_secs(5)).is_retryable());
        assert!(SyncError::server("get_ownership", "502 bad gateway").is_retryable());
    }

    #[test]
    fn test_non_retryable_kinds() {
        assert!(!SyncError::Validation("bad address".into()).is_retryable());
        assert!(!SyncError::UserRejected("declined".into()).is_retryable());
        assert!(!SyncError::InsufficientFunds("0 FLOW".into()).is_retryable());
        assert!(!SyncError::Authentication("expired".into()).is_retryable());
        assert!(!SyncError::storage("set_item", "quota").is_retryable());
        assert!(!SyncError::circuit_open("ownership").is_retryable());
        assert!(!SyncError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn test_circuit_open_message() {
        let err = SyncError::circuit_open("ownership");
        assert!(err.is_circuit_open());
        assert!(err.to_string().contains("circuit open"));
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_timeout_formatting() {
        let err = SyncError::timeout("get_eligible_moments", Duration::from_millis(1500));
        let msg = err.to_string();
        assert!(msg.contains("get_eligible_moments"));
        assert!(msg.contains("1500ms"));
    }

    #[test]
    fn test_connectivity_kinds() {
        assert!(ErrorKind::NetworkUnavailable.is_connectivity());
        assert!(ErrorKind::Timeout.is_connectivity());
        assert!(!ErrorKind::ServerError.is_connectivity());
    }

    #[test]
    fn test_kind_labels_are_snake_case() {
        assert_eq!(ErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(
            serde_json::to_string(&ErrorKind::UserRejected).unwrap(),
            "\"user_rejected\""
        );
    }

    #[test]
    fn test_serde_error_is_validation() {
        let bad = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: SyncError = bad.into();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}
