//! # Weft Sync
//!
//! Peer-to-peer replication of resource block graphs.
//!
//! ## Overview
//!
//! Every resource a process touches gets a [`Uri`] hub. Views attached to
//! the hub move blocks between locations:
//!
//! ```text
//!   Resource ──┐                              ┌── ServerView ──► downstream
//!              ├── Uri hub ── InFlight ───────┤
//!   Resource ──┘      │                       └── ClientView ──► upstream
//!                 MemoryView (origin / cache)
//! ```
//!
//! Connections speak a small command protocol (see [`command`]) encoded by
//! the resumable codec in [`frame`]. [`ConnectionEngine`] is sans-IO;
//! [`driver::drive`] runs it over any tokio stream.
//!
//! ## Key Types
//!
//! - [`UriRegistry`] - Resolves names to hubs through a handler chain
//! - [`InFlight`] - Deduplicates block fetches and tracks pending ACKs
//! - [`Server`] - Serves a registry to downstream connections
//! - [`Upstream`] - Maintains the connection to one upstream location
//! - [`SyncConfig`] - Buffer sizes, limits, timeouts and backoff

pub mod block_queue;
pub mod command;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod frame;
pub mod in_flight;
pub mod remote;
pub mod server;
pub mod transport;
pub mod uri;
pub mod view;

pub use block_queue::{BlockQueue, QueuedBlock};
pub use command::{Address, Command, Opcode};
pub use config::{RetryConfig, SyncConfig};
pub use connection::{ConnectionEngine, ConnectionHandle, Dispatch};
pub use error::{Result, SyncError};
pub use frame::{encode_command, CommandDecoder, FrameEncoder};
pub use in_flight::{next_actor_id, BlockProvider, BlockRequester, InFlight};
pub use remote::Upstream;
pub use server::Server;
pub use transport::{Acceptor, BoxedStream, MemoryNetwork, Transport};
pub use uri::{Origin, Uri, UriHandler, UriId, UriListener, UriRegistry};
pub use view::{ClientView, MemoryOrigin, MemoryRole, MemoryView, ServerView, View};
