//! # Weft Core
//!
//! Causal primitives for the Weft replication engine: peers, ticks, tick
//! sets, vector clocks, blocks and the resumable codec.
//!
//! This crate contains no I/O and no async code.
//!
//! ## Key Types
//!
//! - [`Peer`] / [`PeerUid`] - Interned peer identity
//! - [`Tick`] - 64-bit causal stamp (24-bit peer index, 40-bit time)
//! - [`Clock`] - Monotonic tick source for the local peer
//! - [`TickSet`] - "Is this exact tick known"
//! - [`MaxTickMap`] - "Has this peer reached time T" (happened-before)
//! - [`Block`] / [`BlockBody`] - Replication unit and its causal metadata
//!
//! ## Codec
//!
//! Every wire value is read and written by a resumable state machine. See
//! the [`codec`] module.

pub mod block;
pub mod codec;
pub mod error;
pub mod max_tick;
pub mod peer;
pub mod tick;
pub mod tick_set;

mod slots;

pub use block::{Block, BlockBody, ObjectId, VersionSet};
pub use codec::{Progress, ReadCursor, WriteCursor};
pub use error::{CodecError, CoreError, Result};
pub use max_tick::MaxTickMap;
pub use peer::{Peer, PeerUid};
pub use tick::{Clock, Tick};
pub use tick_set::TickSet;
