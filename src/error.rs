// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the synchronization engine.
//!
//! Errors are categorized by their source (transport, registry, config,
//! certificate store) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | gRPC failures, connection loss, stream resets |
//! | `Http` | Yes | Directory or CA endpoint unreachable |
//! | `NotFound` | No | Series or stored certificate missing |
//! | `AlreadyExists` | No | Registry create on an existing series |
//! | `Config` | No | Configuration invalid |
//! | `CertStore` | No | Local certificate database errors |
//! | `Canceled` | No | Operation aborted by shutdown |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to decide whether the enclosing loop
//! should restart. Retryable errors indicate transient network or
//! availability issues and the per-series worker sleeps one second and
//! starts a fresh round. Non-retryable errors indicate bugs, configuration
//! problems, or deliberate signals (`AlreadyExists` is success for
//! idempotent registry creation; `Canceled` means shutdown).

use thiserror::Error;

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while mirroring series data.
#[derive(Error, Debug)]
pub enum SyncError {
    /// gRPC transport or server error.
    ///
    /// Covers dial failures, dropped subscriptions, mid-stream resets and
    /// rejected submits. Always retryable: the enclosing loop restarts.
    #[error("transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<tonic::Status>,
    },

    /// HTTP error against the thing directory or a CA endpoint.
    #[error("http error ({url}): {message}")]
    Http { url: String, message: String },

    /// The requested entity does not exist.
    ///
    /// A registry lookup miss skips one series for the round; a certificate
    /// store miss is the signal that enrolment may proceed.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity already exists.
    ///
    /// Load-bearing for registry propagation: `Add` on an existing series
    /// is treated as success by callers.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invalid or missing configuration.
    ///
    /// Fatal at boot; fix the configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate store failure.
    ///
    /// Local database problems need operator attention; a uniqueness
    /// conflict on `add` is fatal for that host only.
    #[error("certificate store error: {0}")]
    CertStore(String),

    /// The operation was aborted by cancellation.
    ///
    /// Silent exit: workers observing this stop without logging an error.
    #[error("operation canceled")]
    Canceled,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a transport error with an operation label.
    pub fn transport(operation: impl Into<String>, source: tonic::Status) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.message().to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without a gRPC status.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an HTTP error.
    pub fn http(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { .. } => true,
            Self::NotFound(_) => false,
            Self::AlreadyExists(_) => false,
            Self::Config(_) => false,
            Self::CertStore(_) => false,
            Self::Canceled => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Map a gRPC status into the engine's taxonomy.
    ///
    /// `NotFound` and `AlreadyExists` carry meaning for the registry flow;
    /// `Cancelled` collapses into [`SyncError::Canceled`]; everything else
    /// is transport.
    pub fn from_status(operation: &str, status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(status.message().to_string()),
            tonic::Code::AlreadyExists => Self::AlreadyExists(status.message().to_string()),
            tonic::Code::Cancelled => Self::Canceled,
            _ => Self::transport(operation, status),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        Self::CertStore(e.to_string())
    }
}
