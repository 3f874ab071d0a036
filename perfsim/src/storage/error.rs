//! Storage error types.

use thiserror::Error;

/// Errors that can occur while talking to the shared store.
///
/// Every variant is a `StorageFailure` from the caller's point of view: the
/// store is unreachable or holds data that cannot be decoded. The core never
/// retries these; they propagate to whoever issued the operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Serialization/deserialization of a stored value failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored entry exists but cannot be decoded.
    #[error("Corrupt entry for key '{key}': {reason}")]
    Corrupt {
        /// Key whose entry failed to decode.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// Storage backend is unavailable.
    #[error("Storage unavailable")]
    Unavailable,

    /// Generic storage operation failure.
    #[error("Storage operation failed: {0}")]
    OperationFailed(String),
}
