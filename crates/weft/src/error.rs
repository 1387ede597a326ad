//! Error types for the Weft engine.

use thiserror::Error;
use weft_core::{CodecError, CoreError};
use weft_perms::PermsError;
use weft_store::StoreError;
use weft_sync::SyncError;

/// Errors surfaced by resources and workspaces.
#[derive(Debug, Error)]
pub enum WeftError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("permission error: {0}")]
    Perms(#[from] PermsError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The upstream refused access to the resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A remote location could not resolve the resource name.
    #[error("remote cannot resolve: {0}")]
    Remote(String),

    /// No local handler recognizes the resource name.
    #[error("no handler for resource: {0}")]
    NoHandler(String),

    #[error("resource closed: {0}")]
    Closed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for Weft operations.
pub type Result<T> = std::result::Result<T, WeftError>;
