//! Error types for seep
//!
//! Errors are split by how a caller must react: commit conflicts are
//! retried with a fresh snapshot, configuration and invariant errors are
//! never retried, and infrastructure errors surface only after the call
//! site's retry budget is spent. We use `thiserror` for `Display` and
//! `Error` implementations.

use crate::key::KeyError;
use crate::types::{Bytes, Column};
use std::io;
use thiserror::Error;

/// Result type alias for seep operations
pub type SeepResult<T> = std::result::Result<T, SeepError>;

/// Error types for seep
#[derive(Debug, Error)]
pub enum SeepError {
    /// Another transaction won the race for a cell
    #[error("commit conflict on {row} {column}: {reason}")]
    CommitConflict {
        /// Row of the contended cell
        row: Bytes,
        /// Column of the contended cell
        column: Column,
        /// What the conflict was
        reason: String,
    },

    /// Observer registration or notification type is wrong
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A caller passed an argument that can never be valid
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote service stayed unreachable after all retries
    #[error("{service} unavailable after {attempts} attempt(s): {message}")]
    Unavailable {
        /// Service name ("oracle", "store", ...)
        service: &'static str,
        /// Attempts made before giving up
        attempts: u32,
        /// Last error seen
        message: String,
    },

    /// An observer callback failed
    #[error("observer {observer} failed on {row} {column}: {message}")]
    Observer {
        /// Observer identifier
        observer: String,
        /// Row of the notification
        row: Bytes,
        /// Observed column
        column: Column,
        /// Application error text
        message: String,
    },

    /// Operation is not legal in the transaction's current state
    #[error("invalid transaction state: expected {expected}, found {actual}")]
    InvalidState {
        /// State(s) the operation requires
        expected: String,
        /// State the transaction is actually in
        actual: String,
    },

    /// Store adapter failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (config files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SeepError {
    /// Build a conflict error
    pub fn conflict(row: &Bytes, column: &Column, reason: impl Into<String>) -> Self {
        SeepError::CommitConflict {
            row: row.clone(),
            column: column.clone(),
            reason: reason.into(),
        }
    }

    /// Build a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        SeepError::Configuration(msg.into())
    }

    /// Build an invalid-argument error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        SeepError::InvalidArgument(msg.into())
    }

    /// Build a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        SeepError::Storage(msg.into())
    }

    /// Build an invalid-state error
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        SeepError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// True for commit conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, SeepError::CommitConflict { .. })
    }

    /// True if retrying the whole unit of work with a fresh snapshot may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SeepError::CommitConflict { .. } | SeepError::Unavailable { .. }
        )
    }
}

impl From<bincode::Error> for SeepError {
    fn from(e: bincode::Error) -> Self {
        SeepError::Serialization(e.to_string())
    }
}

impl From<KeyError> for SeepError {
    fn from(e: KeyError) -> Self {
        SeepError::InvalidArgument(e.to_string())
    }
}

impl From<toml::de::Error> for SeepError {
    fn from(e: toml::de::Error) -> Self {
        SeepError::Configuration(e.to_string())
    }
}
