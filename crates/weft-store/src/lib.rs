//! # Weft Store
//!
//! Storage abstraction for block payloads held by origin and cache
//! locations.
//!
//! ## Key Types
//!
//! - [`Store`] - Per-resource tick -> payload table
//! - [`StoreExt`] - Helpers on top of any store (stubbing superseded blocks)
//! - [`MemoryStore`] - In-memory implementation
//! - [`PutResult`] - Result of storing a block
//!
//! ## Design Notes
//!
//! - **Idempotent puts**: storing the same tick twice returns `AlreadyExists`
//! - **Stubs, not deletes**: superseded blocks keep their causal metadata so
//!   later blocks that depend on them can still be placed by readers

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use traits::{PutResult, Store, StoreExt};
