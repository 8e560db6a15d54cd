// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the firehose mirror.
//!
//! Errors are grouped by where they come from: the feed transport, the
//! SQLite mirror, frame parsing, or the engine's own lifecycle.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Socket errors, refused connections, remote close |
//! | `Database` | Busy/locked only | SQLite errors from the mirror or cursor store |
//! | `Config` | No | Configuration invalid |
//! | `EnvelopeParse` | No | Malformed frame from the feed |
//! | `ReconnectExhausted` | No | Reconnect budget spent; the process must exit |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Only `Transport` errors feed the reconnect loop. Everything that goes
//! wrong while handling a single envelope is logged and contained by the
//! worker; see [`crate::config::WriteFailurePolicy`].

use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while syncing the feed into the mirror.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connection to the feed failed or dropped.
    ///
    /// Drives the reconnect/backoff state machine in [`crate::stream`].
    #[error("Transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    /// SQLite error from the mirror or the cursor store.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A feed frame could not be decoded into an envelope.
    ///
    /// Dropped with a log line; never fatal.
    #[error("Envelope parse error: {0}")]
    EnvelopeParse(String),

    /// The stream client gave up after too many consecutive failures.
    #[error("Reconnect budget exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: usize, last_error: String },

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running engine).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a transport error for an endpoint.
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Database(e) => crate::resilience::is_sqlite_busy_error(e),
            Self::Config(_) => false,
            Self::EnvelopeParse(_) => false,
            Self::ReconnectExhausted { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::EnvelopeParse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_transport() {
        let err = SyncError::transport("wss://feed.example", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("wss://feed.example"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_not_retryable_database_row_not_found() {
        let err = SyncError::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncError::Config("missing endpoint".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_envelope_parse() {
        let err = SyncError::EnvelopeParse("missing did".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_reconnect_exhausted_formatting() {
        let err = SyncError::ReconnectExhausted {
            attempts: 5,
            last_error: "refused".to_string(),
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains("refused"));
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = SyncError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_shutdown_and_internal() {
        assert!(!SyncError::Shutdown.is_retryable());
        assert!(!SyncError::Internal("boom".to_string()).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SyncError = json_err.into();
        assert!(matches!(err, SyncError::EnvelopeParse(_)));
    }
}
