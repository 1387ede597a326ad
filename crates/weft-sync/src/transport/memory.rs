//! In-process transport over `tokio::io::duplex` pipes.
//!
//! A [`MemoryNetwork`] maps addresses to listeners. Connecting to an
//! address with no listener fails like a refused TCP connect, which is
//! enough to exercise reconnection and partitions in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::transport::{Acceptor, BoxedStream, Transport};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting on `addr`, replacing any previous listener.
    pub fn listen(&self, addr: &str) -> MemoryListener {
        let (tx, rx) = mpsc::channel(64);
        self.listeners.lock().insert(addr.to_string(), tx);
        tracing::debug!(addr, "memory listener bound");
        MemoryListener {
            addr: addr.to_string(),
            incoming: rx,
        }
    }

    /// Stop accepting on `addr`. Established streams are unaffected.
    pub fn unlisten(&self, addr: &str) -> bool {
        self.listeners.lock().remove(addr).is_some()
    }

    pub fn transport(&self, addr: &str) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            addr: addr.to_string(),
            capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    async fn connect(&self, addr: &str, capacity: usize) -> Result<DuplexStream> {
        let sender = self.listeners.lock().get(addr).cloned();
        let Some(sender) = sender else {
            return Err(SyncError::Transport(format!("connection refused: {addr}")));
        };
        let (local, remote) = tokio::io::duplex(capacity);
        sender
            .send(remote)
            .await
            .map_err(|_| SyncError::Transport(format!("listener gone: {addr}")))?;
        Ok(local)
    }
}

pub struct MemoryListener {
    addr: String,
    incoming: mpsc::Receiver<DuplexStream>,
}

impl MemoryListener {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Acceptor for MemoryListener {
    async fn accept(&mut self) -> Option<BoxedStream> {
        let stream = self.incoming.recv().await?;
        Some(Box::new(stream))
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: String,
    capacity: usize,
}

impl MemoryTransport {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = self.network.connect(&self.addr, self.capacity).await?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.addr)
    }
}
