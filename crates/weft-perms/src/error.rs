//! Error types for the permissions module.

use thiserror::Error;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Byte on the wire is not a permission ordinal.
    #[error("invalid permission ordinal: {0}")]
    InvalidPermission(u8),

    /// Grant table could not be parsed.
    #[error("invalid grant table: {0}")]
    InvalidGrant(String),
}

impl From<serde_json::Error> for PermsError {
    fn from(e: serde_json::Error) -> Self {
        PermsError::InvalidGrant(e.to_string())
    }
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
