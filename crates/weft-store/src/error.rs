//! Error types for the store module.

use thiserror::Error;

use weft_core::{CodecError, Tick};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Stored bytes are not a valid block body.
    #[error("corrupt block {tick} in {resource}: {source}")]
    Corrupt {
        resource: String,
        tick: Tick,
        #[source]
        source: CodecError,
    },

    /// Block not found.
    #[error("block {tick} not found in {resource}")]
    NotFound { resource: String, tick: Tick },

    /// Backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
