//! Error types for statfan.
//!
//! All errors are strongly typed using thiserror. Nothing here is fatal to the
//! process: request-side errors degrade into protocol responses (`fail`), and
//! upstream-side errors are logged and counted.

use std::path::PathBuf;

use thiserror::Error;

/// Validation errors for caller-supplied request parameters.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No sequence number given")]
    MissingCursor,

    #[error("Sequence number '{raw}' is not an integer")]
    InvalidCursor {
        raw: String,
    },
}

/// Errors raised while accepting messages from the upstream feed.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Malformed upstream message: {reason}")]
    Malformed {
        reason: String,
    },

    #[error("Upstream message is not a JSON object")]
    NotAnObject,

    #[error("Upstream line exceeds {limit} bytes")]
    LineTooLong {
        limit: usize,
    },

    #[error("Ingest queue full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Ingest worker is not running")]
    Disconnected,
}

/// Errors raised by a snapshot provider.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot source unavailable: {message}")]
    Unavailable {
        message: String,
    },

    #[error("Snapshot serialization failed: {message}")]
    Serialization {
        message: String,
    },
}

/// Errors raised while loading or validating configuration.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        message: String,
    },

    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        field: String,
        reason: String,
    },
}

/// Error returned by the service and ingest surfaces.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StatfanError {
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl StatfanError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Internal { .. } => false,
            Self::Ingest(e) => matches!(e, IngestError::QueueFull { .. }),
            Self::Snapshot(e) => matches!(e, SnapshotError::Unavailable { .. }),
        }
    }
}

/// Result type alias for statfan operations.
pub type StatfanResult<T> = Result<T, StatfanError>;
