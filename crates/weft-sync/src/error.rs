//! Error types for the sync module.

use thiserror::Error;

use weft_core::{CodecError, CoreError};
use weft_store::StoreError;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Peer sent bytes that do not decode to a command.
    #[error("malformed frame: {0}")]
    Malformed(#[from] CodecError),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport could not establish a stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection attempt did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Upstream rejected the subscription. Not retried.
    #[error("permission rejected for {0}")]
    Rejected(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Core primitive failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Connection was closed locally.
    #[error("connection closed")]
    Closed,
}

impl SyncError {
    /// Whether a retry loop should try again after this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            SyncError::Malformed(_)
            | SyncError::Io(_)
            | SyncError::Transport(_)
            | SyncError::Timeout(_)
            | SyncError::Closed => true,
            SyncError::Rejected(_)
            | SyncError::Store(_)
            | SyncError::Core(_)
            | SyncError::Config(_) => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(SyncError::Timeout("connect".into()).is_retriable());
        assert!(SyncError::Malformed(CodecError::InvalidTag(0xEE)).is_retriable());
        assert!(!SyncError::Rejected("doc".into()).is_retriable());
        assert!(!SyncError::Config("bad".into()).is_retriable());
    }
}
