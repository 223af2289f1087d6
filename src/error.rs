//! Error handling for granary.
//!
//! The library signals failures through a single typed [`Error`] enum rather
//! than process exit codes, so the embedding framework can apply its own
//! retry policy. The taxonomy matters to callers:
//!
//! - [`Error::InvalidArgument`] — rejected synchronously, never retried
//! - serialization conflicts (SQLSTATE `40001`) — retried transparently
//!   inside the operation that hit them, see [`Error::is_serialization_failure`]
//! - [`Error::LockTimeout`] — another server instance holds the maintenance
//!   lock; the current sweep cycle is skipped, not failed
//! - [`Error::Cancelled`] — graceful shutdown, distinct from failure
//! - everything else — fatal to the current operation and propagated

use std::time::Duration;

use thiserror::Error;

/// A specialized Result type for granary operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE class reported by PostgreSQL and CockroachDB for transaction
/// serialization conflicts.
const SERIALIZATION_FAILURE: &str = "40001";

/// The main error type for granary.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input, e.g. an empty queue list. Never retried.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The distributed maintenance lock could not be acquired in time.
    /// Interpreted as "another server is already doing this work".
    #[error("could not acquire lock on {resource:?} within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    /// The operation was interrupted by a cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Database or connectivity failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected configuration value.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Create a validation error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is a transaction serialization conflict that is
    /// safe to retry transparently within the same logical operation.
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some(SERIALIZATION_FAILURE)
            }
            _ => false,
        }
    }

    /// Whether this error represents cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
