//! Store trait: the abstract interface for block persistence.
//!
//! Views call into the store from inside protocol dispatch, which is
//! synchronous, so the trait is synchronous too. Backends that need I/O are
//! expected to keep a write-behind cache.

use bytes::Bytes;
use weft_core::{BlockBody, Tick, TickSet};

use crate::error::{Result, StoreError};

/// Result of storing a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutResult {
    /// Block was stored.
    Inserted,
    /// A block with this tick already exists (idempotent, not an error).
    AlreadyExists,
}

/// Per-resource table of tick -> encoded block body.
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Block Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a block's payload.
    fn put(&self, resource: &str, tick: Tick, payload: Bytes) -> Result<PutResult>;

    /// Fetch a block's payload.
    fn get(&self, resource: &str, tick: Tick) -> Result<Option<Bytes>>;

    /// Overwrite an existing block's payload. Returns false if absent.
    fn replace(&self, resource: &str, tick: Tick, payload: Bytes) -> Result<bool>;

    /// Forget a block entirely. Returns false if absent.
    fn remove(&self, resource: &str, tick: Tick) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Resource Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Every tick stored for a resource.
    fn known(&self, resource: &str) -> Result<TickSet>;

    /// Names of all resources with at least one block.
    fn resources(&self) -> Result<Vec<String>>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    fn contains(&self, resource: &str, tick: Tick) -> Result<bool> {
        Ok(self.get(resource, tick)?.is_some())
    }

    /// Replace a superseded block with a version-less stub.
    ///
    /// The stub keeps deps, happened-before and generation so blocks that
    /// depend on this tick can still be placed. Returns false if the block
    /// is not stored.
    fn stub_out(&self, resource: &str, tick: Tick) -> Result<bool> {
        let Some(payload) = self.get(resource, tick)? else {
            return Ok(false);
        };
        let corrupt = |source| StoreError::Corrupt {
            resource: resource.to_string(),
            tick,
            source,
        };
        let body = BlockBody::decode(&payload).map_err(corrupt)?;
        if body.versions.is_empty() {
            return Ok(true);
        }
        let stub = body.stub().encode().map_err(corrupt)?;
        self.replace(resource, tick, stub)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
