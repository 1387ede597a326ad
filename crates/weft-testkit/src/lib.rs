//! # Weft Testkit
//!
//! Testing utilities for Weft.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: deterministic peers and ticks, block builders, and
//!   [`Link`] for wiring a workspace's upstream to a server in memory
//! - **Generators**: proptest strategies for version sets and write plans
//! - **Vectors**: wire encodings of commands that must never change
//!
//! ## Linking a client to a server
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use weft::perms::{Permission, StaticPolicy};
//! use weft_testkit::fixtures::{client_workspace, origin, Link};
//!
//! let (_store, server) = origin(Arc::new(StaticPolicy(Permission::Write)));
//! let workspace = client_workspace("doc-example");
//! let doc = workspace.resource("doc").unwrap();
//!
//! let mut link = Link::new(&workspace.upstreams()[0], &server);
//! link.pump().unwrap();
//! assert!(doc.state() == weft::ResourceState::UpToDate);
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{
    block, client_workspace, max_ticks, origin, peer, pump, tick, tick_set, versions, BlockBuilder,
    Link,
};
pub use generators::{arrival_order, object_id, value, version_set, write_plan, PlannedWrite};
pub use vectors::{all_vectors, verify_all_vectors, WireVector};

/// Install a fmt subscriber that writes through the test harness. Safe to
/// call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
