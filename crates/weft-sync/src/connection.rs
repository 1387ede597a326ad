//! Connection protocol engine.
//!
//! A connection has two halves:
//!
//! - [`ConnectionHandle`] is shared with views. They post commands and
//!   blocks to it from any thread; it queues them and wakes the driver.
//! - [`ConnectionEngine`] is owned by whoever moves bytes. It decodes
//!   inbound frames and dispatches them, and it encodes queued outbound
//!   commands into bounded buffers.
//!
//! The engine does no I/O. [`crate::driver::drive`] runs it over a tokio
//! stream; tests pump bytes between two engines by hand.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use weft_core::{Block, Progress, ReadCursor, Tick, TickSet, WriteCursor};
use weft_perms::{Permission, SessionInfo};

use crate::block_queue::BlockQueue;
use crate::command::{Address, Command};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::frame::{CommandDecoder, FrameEncoder};
use crate::in_flight::next_actor_id;
use crate::uri::{Uri, UriId};

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Shared side of a connection.
pub struct ConnectionHandle {
    id: u64,
    outbox: Mutex<VecDeque<Command>>,
    blocks: Mutex<BlockQueue>,
    wake: Notify,
    closed: AtomicBool,
    session: Mutex<SessionInfo>,
    /// Blocks sent to the peer that it has not acknowledged yet.
    unacked: Mutex<HashSet<(UriId, Tick)>>,
}

impl ConnectionHandle {
    pub fn new(config: &SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            id: next_actor_id(),
            outbox: Mutex::new(VecDeque::new()),
            blocks: Mutex::new(BlockQueue::new(config.queue_fifo_threshold)),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            session: Mutex::new(SessionInfo::default()),
            unacked: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the driver to shut the connection down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(connection = self.id, "connection closing");
        }
        self.wake.notify_one();
    }

    /// Wait until something was posted or the connection was closed.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    /// Headers and address the peer announced.
    pub fn session(&self) -> SessionInfo {
        self.session.lock().clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Posting
    // ─────────────────────────────────────────────────────────────────────────

    pub fn post(&self, command: Command) {
        if self.is_closed() {
            return;
        }
        self.outbox.lock().push_back(command);
        self.wake.notify_one();
    }

    pub fn post_block(&self, uri: &Uri, block: Block) {
        if self.is_closed() {
            return;
        }
        self.blocks
            .lock()
            .enqueue(uri.id(), uri.shared_name(), block);
        self.wake.notify_one();
    }

    /// Drop a queued block that the peer no longer wants.
    pub fn cancel_block(&self, uri: &Uri, tick: Tick) -> bool {
        self.blocks.lock().cancel(uri.id(), tick).is_some()
    }

    pub fn is_block_queued(&self, uri: &Uri, tick: Tick) -> bool {
        self.blocks.lock().contains(uri.id(), tick)
    }

    pub fn post_permission(&self, resource: &str, permission: Permission) {
        self.post(Command::Permission {
            resource: resource.to_string(),
            permission,
        });
    }

    pub fn post_known(&self, resource: &str, ticks: TickSet) {
        self.post(Command::OnKnown {
            resource: resource.to_string(),
            ticks,
        });
    }

    pub fn post_get_known(&self, resource: &str) {
        self.post(Command::GetKnown {
            resource: resource.to_string(),
        });
    }

    pub fn post_get_block(&self, resource: &str, tick: Tick) {
        self.post(Command::GetBlock {
            resource: resource.to_string(),
            tick,
        });
    }

    pub fn post_cancel(&self, resource: &str, tick: Tick) {
        self.post(Command::CancelBlock {
            resource: resource.to_string(),
            tick,
        });
    }

    pub fn post_ack(&self, resource: &str, tick: Tick) {
        self.post(Command::AckBlock {
            resource: resource.to_string(),
            tick,
        });
    }

    pub fn post_subscribe(&self, resource: &str) {
        self.post(Command::Subscribe {
            resource: resource.to_string(),
        });
    }

    pub fn post_unsubscribe(&self, resource: &str) {
        self.post(Command::Unsubscribe {
            resource: resource.to_string(),
        });
    }

    pub fn post_unresolved(&self, resource: &str) {
        self.post(Command::Unresolved {
            resource: resource.to_string(),
        });
    }

    pub fn post_headers(&self, headers: Vec<(String, String)>) {
        self.post(Command::Headers(headers));
    }

    pub fn post_address(&self, address: Address) {
        self.post(Command::Address(address));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Acknowledgement tracking
    // ─────────────────────────────────────────────────────────────────────────

    pub fn track_unacked(&self, uri: UriId, tick: Tick) {
        self.unacked.lock().insert((uri, tick));
    }

    /// The peer acknowledged a block. Returns whether it was outstanding.
    pub fn acknowledged(&self, uri: UriId, tick: Tick) -> bool {
        self.unacked.lock().remove(&(uri, tick))
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    fn next_outbound(&self) -> Option<FrameEncoder> {
        if let Some(command) = self.outbox.lock().pop_front() {
            return Some(FrameEncoder::new(&command));
        }
        let queued = self.blocks.lock().next_block()?;
        Some(FrameEncoder::new(&Command::OnBlock {
            resource: queued.resource.to_string(),
            block: queued.block,
        }))
    }

    fn has_outbound(&self) -> bool {
        !self.outbox.lock().is_empty() || !self.blocks.lock().is_empty()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("outbox", &self.outbox.lock().len())
            .field("blocks", &self.blocks.lock().len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Receives decoded commands for one side of a connection.
pub trait Dispatch: Send + Sync {
    /// Hub for a resource named by the peer. Returning `None` drops the
    /// command; implementations may answer the peer first.
    fn resolve(&self, connection: &Arc<ConnectionHandle>, name: &str) -> Option<Arc<Uri>>;

    fn on_command(&self, connection: &Arc<ConnectionHandle>, uri: &Arc<Uri>, command: Command);

    fn on_disconnect(&self, connection: &Arc<ConnectionHandle>);
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ConnectionEngine {
    handle: Arc<ConnectionHandle>,
    dispatch: Arc<dyn Dispatch>,
    reader: ReadCursor,
    decoder: CommandDecoder,
    writer: WriteCursor,
    current: Option<FrameEncoder>,
    uris: HashMap<String, Arc<Uri>>,
    buffer_size: usize,
    finished: bool,
}

impl ConnectionEngine {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        dispatch: Arc<dyn Dispatch>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            handle,
            dispatch,
            reader: ReadCursor::new(),
            decoder: CommandDecoder::new(config.max_block_len),
            writer: WriteCursor::new(config.buffer_size),
            current: None,
            uris: HashMap::new(),
            buffer_size: config.buffer_size,
            finished: false,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Feed inbound bytes and dispatch every complete command.
    ///
    /// A decode error is fatal for the connection; the caller should tear
    /// it down with [`ConnectionEngine::shutdown`].
    pub fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        self.reader.feed(bytes);
        while let Progress::Done(command) = self.decoder.decode(&mut self.reader)? {
            self.dispatch_command(command);
        }
        Ok(())
    }

    fn dispatch_command(&mut self, command: Command) {
        tracing::trace!(connection = self.handle.id(), opcode = ?command.opcode(), "received");
        let name = match command {
            Command::Headers(headers) => {
                self.handle.session.lock().headers = headers.into_iter().collect();
                return;
            }
            Command::Address(address) => {
                self.handle.session.lock().address = Some(address.to_string());
                return;
            }
            ref scoped => scoped.resource().unwrap_or_default().to_string(),
        };

        let uri = match self.uris.get(&name) {
            Some(uri) => uri.clone(),
            None => match self.dispatch.resolve(&self.handle, &name) {
                Some(uri) => {
                    self.uris.insert(name, uri.clone());
                    uri
                }
                None => return,
            },
        };
        self.dispatch.on_command(&self.handle, &uri, command);
    }

    /// Encode pending output. Returns at most one buffer of `buffer_size`
    /// bytes, or `None` when nothing is queued.
    pub fn transmit(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.current.is_none() {
                self.current = self.handle.next_outbound();
            }
            let Some(encoder) = self.current.as_mut() else {
                break;
            };
            match encoder.encode(&mut self.writer)? {
                Progress::Done(()) => self.current = None,
                Progress::Suspended => break,
            }
        }
        if self.writer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.writer.take()))
        }
    }

    /// Whether [`ConnectionEngine::transmit`] would produce output.
    pub fn wants_transmit(&self) -> bool {
        self.current.is_some() || self.handle.has_outbound()
    }

    /// Tear down: close the handle and tell the dispatcher. Idempotent.
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.handle.close();
        self.dispatch.on_disconnect(&self.handle);
        self.uris.clear();
    }
}

impl Drop for ConnectionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
