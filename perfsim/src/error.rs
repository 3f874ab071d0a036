//! Error types for the coordination layer.

use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the coordination components.
///
/// Unknown simulation ids on mutation calls are deliberately absent: those
/// calls are no-ops and report `Ok(false)` instead.
#[derive(Debug, Error)]
pub enum PerfSimError {
    /// The shared store is unreachable or holds undecodable data.
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    /// A caller-supplied parameter is outside its configured bounds.
    ///
    /// Raised before any state is mutated.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name as the caller knows it.
        name: &'static str,
        /// Human readable validation message.
        reason: String,
    },

    /// Lock acquisition exceeded the caller's ceiling.
    #[error("Timed out after {waited_ms} ms waiting for session lock '{session_id}'")]
    LockTimeout {
        /// Session whose lock could not be acquired.
        session_id: String,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// The lock resource itself could not be opened, locked or written.
    #[error("Session lock failed: {0}")]
    LockFailed(String),

    /// Configuration rejected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A helper task panicked or was cancelled.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl PerfSimError {
    /// Shorthand for an [`PerfSimError::InvalidParameter`].
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        PerfSimError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for PerfSimError {
    fn from(err: tokio::task::JoinError) -> Self {
        PerfSimError::TaskFailed(err.to_string())
    }
}

/// Result alias used across the crate.
pub type PerfSimResult<T> = Result<T, PerfSimError>;
