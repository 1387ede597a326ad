//! Stream transports.
//!
//! The protocol engine only needs an ordered, reliable byte stream. A
//! [`Transport`] knows how to open one to a fixed upstream; an [`Acceptor`]
//! yields inbound streams for a server.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub mod memory;

pub use memory::{MemoryListener, MemoryNetwork, MemoryTransport};

/// Any bidirectional byte stream the driver can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens streams to one upstream location.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Yields inbound streams until the listener shuts down.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Option<BoxedStream>;
}
