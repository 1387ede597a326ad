//! # Weft
//!
//! Causal replication of named resources between peers.
//!
//! ## Overview
//!
//! A [`Workspace`] is one local peer. Each resource it opens becomes a
//! [`Resource`]: a replica that fetches the blocks other locations know
//! about, applies them once their causal past is present, and keeps them in
//! one deterministic order. Concurrent writes from different peers converge
//! to the same ordered list everywhere, whatever order they arrive in.
//!
//! ## Key Concepts
//!
//! - **Block**: an immutable set of object versions stamped with one tick.
//! - **Masking**: a later block writing an object hides earlier versions of
//!   it; a block with nothing left visible drops out of the list.
//! - **Snapshot**: where resources commit the versions that became visible.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use weft::{VersionSet, Workspace};
//! use weft::store::MemoryStore;
//!
//! async fn example() -> weft::Result<()> {
//!     let workspace = Workspace::builder()
//!         .memory_origin("", Arc::new(MemoryStore::new()))
//!         .build()?;
//!
//!     let doc = workspace.open("notes/today").await?;
//!     let mut versions = VersionSet::new();
//!     versions.insert(1, Bytes::from_static(b"hello"));
//!     doc.write(versions)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `weft::core` - Ticks, peers, blocks and the codec
//! - `weft::store` - Block storage
//! - `weft::sync` - Protocol, views and connections
//! - `weft::perms` - Permissions and policies

pub mod config;
pub mod convergence;
pub mod error;
pub mod order;
pub mod resource;
pub mod snapshot;
pub mod workspace;

pub use weft_core as core;
pub use weft_perms as perms;
pub use weft_store as store;
pub use weft_sync as sync;

pub use config::{ClockMode, WorkspaceConfig};
pub use convergence::{state_hash, values_hash};
pub use error::{Result, WeftError};
pub use order::{BlockList, Insertion, OrderedBlock};
pub use resource::{CancelReason, Resource, ResourceState};
pub use snapshot::{MemorySnapshot, Snapshot};
pub use workspace::{Workspace, WorkspaceBuilder};

pub use weft_core::{Block, BlockBody, Clock, ObjectId, Peer, PeerUid, Tick, TickSet, VersionSet};
