//! Registry of block fetches and upload acknowledgements in progress.
//!
//! A fetch is keyed by (resource, tick). The first request for a key starts
//! the fetch; later requests only join the requester list. When the block
//! arrives every requester is called back once. Requester lists are
//! copy-on-write so delivery never holds the map lock.
//!
//! One table belongs to each [`UriRegistry`](crate::uri::UriRegistry)
//! rather than to the process. Every hub of a registry shares it, so fetch
//! deduplication spans all resources of one participant, while a server and
//! client workspaces hosted in the same process keep separate tables. The
//! table is dropped with its registry, and counts such as [`InFlight::len`]
//! describe one participant only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use weft_core::{Block, Tick};

use crate::connection::ConnectionHandle;
use crate::uri::UriId;

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for a view, listener, requester or
/// connection.
pub fn next_actor_id() -> u64 {
    NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Someone waiting for a block.
pub trait BlockRequester: Send + Sync {
    fn requester_id(&self) -> u64;

    fn on_block(&self, block: &Block);

    /// The fetch was abandoned. The requester should fall back to what it
    /// already has.
    fn failed(&self, tick: Tick, reason: &str);
}

/// Someone fetching a block on behalf of requesters.
pub trait BlockProvider: Send + Sync {
    fn provider_id(&self) -> u64;

    /// Nobody wants the block anymore.
    fn cancel(&self, tick: Tick);
}

type Requesters = Arc<[Arc<dyn BlockRequester>]>;

struct Fetch {
    requesters: Requesters,
    providers: Vec<Arc<dyn BlockProvider>>,
    delivering: Vec<u64>,
}

#[derive(Default)]
pub struct InFlight {
    fetches: DashMap<(UriId, Tick), Fetch>,
    acks: DashMap<(UriId, Tick), Vec<Arc<ConnectionHandle>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fetches
    // ─────────────────────────────────────────────────────────────────────────

    /// Register `requester` for a block. Runs `fetch` only if this is the
    /// first request for the key. Returns whether the fetch was started.
    pub fn get(
        &self,
        uri: UriId,
        tick: Tick,
        requester: Arc<dyn BlockRequester>,
        fetch: impl FnOnce(),
    ) -> bool {
        let first = match self.fetches.entry((uri, tick)) {
            Entry::Occupied(mut entry) => {
                let id = requester.requester_id();
                let fetch = entry.get_mut();
                if !fetch.requesters.iter().any(|r| r.requester_id() == id) {
                    let mut grown: Vec<_> = fetch.requesters.iter().cloned().collect();
                    grown.push(requester);
                    fetch.requesters = grown.into();
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Fetch {
                    requesters: Arc::from(vec![requester]),
                    providers: Vec::new(),
                    delivering: Vec::new(),
                });
                true
            }
        };
        if first {
            tracing::trace!(%tick, "starting fetch");
            fetch();
        }
        first
    }

    /// A provider is about to fetch. Returns false if nobody is waiting.
    pub fn starting(&self, uri: UriId, tick: Tick, provider: Arc<dyn BlockProvider>) -> bool {
        let Some(mut fetch) = self.fetches.get_mut(&(uri, tick)) else {
            return false;
        };
        let id = provider.provider_id();
        if !fetch.providers.iter().any(|p| p.provider_id() == id) {
            fetch.providers.push(provider);
        }
        true
    }

    /// A provider has the block and is handing it over; it won't be
    /// cancelled from here on.
    pub fn delivering(&self, uri: UriId, tick: Tick, provider_id: u64) {
        if let Some(mut fetch) = self.fetches.get_mut(&(uri, tick)) {
            if !fetch.delivering.contains(&provider_id) {
                fetch.delivering.push(provider_id);
            }
        }
    }

    /// Withdraw one requester. When the last one leaves, the entry is dropped
    /// and providers that are not mid-delivery are cancelled.
    pub fn cancel(&self, uri: UriId, tick: Tick, requester_id: u64) -> bool {
        let key = (uri, tick);
        {
            let Some(mut fetch) = self.fetches.get_mut(&key) else {
                return false;
            };
            if !fetch.requesters.iter().any(|r| r.requester_id() == requester_id) {
                return false;
            }
            let remaining: Vec<_> = fetch
                .requesters
                .iter()
                .filter(|r| r.requester_id() != requester_id)
                .cloned()
                .collect();
            fetch.requesters = remaining.into();
        }
        let Some((_, fetch)) = self.fetches.remove_if(&key, |_, f| f.requesters.is_empty())
        else {
            return true;
        };
        for provider in &fetch.providers {
            if !fetch.delivering.contains(&provider.provider_id()) {
                provider.cancel(tick);
            }
        }
        tracing::trace!(%tick, "fetch cancelled");
        true
    }

    /// The block arrived. Removes the entry and hands back its requesters.
    pub fn complete(&self, uri: UriId, tick: Tick) -> Option<Requesters> {
        self.fetches.remove(&(uri, tick)).map(|(_, f)| f.requesters)
    }

    /// Deliver `block` to whoever is waiting for it.
    pub fn deliver(&self, uri: UriId, block: &Block) -> usize {
        let Some(requesters) = self.complete(uri, block.tick) else {
            return 0;
        };
        for requester in requesters.iter() {
            requester.on_block(block);
        }
        requesters.len()
    }

    /// Give up on a fetch and tell every requester.
    pub fn fail(&self, uri: UriId, tick: Tick, reason: &str) {
        if let Some(requesters) = self.complete(uri, tick) {
            tracing::debug!(%tick, reason, "fetch failed");
            for requester in requesters.iter() {
                requester.failed(tick, reason);
            }
        }
    }

    /// Fail the fetch if nobody has offered to provide it.
    pub fn fail_if_unprovided(&self, uri: UriId, tick: Tick, reason: &str) -> bool {
        let orphaned = self
            .fetches
            .get(&(uri, tick))
            .map(|f| f.providers.is_empty())
            .unwrap_or(false);
        if orphaned {
            self.fail(uri, tick, reason);
        }
        orphaned
    }

    /// A provider went away. Fetches it was the only provider for fail.
    pub fn provider_lost(&self, provider_id: u64) -> usize {
        let orphaned: Vec<(UriId, Tick)> = self
            .fetches
            .iter_mut()
            .filter_map(|mut entry| {
                let before = entry.providers.len();
                entry.providers.retain(|p| p.provider_id() != provider_id);
                entry.delivering.retain(|id| *id != provider_id);
                (entry.providers.len() < before && entry.providers.is_empty())
                    .then(|| *entry.key())
            })
            .collect();
        for (uri, tick) in &orphaned {
            self.fail(*uri, *tick, "provider disconnected");
        }
        orphaned.len()
    }

    pub fn is_pending(&self, uri: UriId, tick: Tick) -> bool {
        self.fetches.contains_key(&(uri, tick))
    }

    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Acknowledgements
    // ─────────────────────────────────────────────────────────────────────────

    /// `connection` uploaded the block and wants an ACK once it is durable.
    pub fn expect_ack(&self, uri: UriId, tick: Tick, connection: Arc<ConnectionHandle>) {
        let mut waiting = self.acks.entry((uri, tick)).or_default();
        if !waiting.iter().any(|c| c.id() == connection.id()) {
            waiting.push(connection);
        }
    }

    /// Connections waiting for an ACK of this block.
    pub fn take_ack(&self, uri: UriId, tick: Tick) -> Vec<Arc<ConnectionHandle>> {
        self.acks
            .remove(&(uri, tick))
            .map(|(_, waiting)| waiting)
            .unwrap_or_default()
    }

    /// Forget a closed connection's pending ACKs.
    pub fn drop_connection(&self, connection_id: u64) {
        self.acks.retain(|_, waiting| {
            waiting.retain(|c| c.id() != connection_id);
            !waiting.is_empty()
        });
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("fetches", &self.fetches.len())
            .field("acks", &self.acks.len())
            .finish()
    }
}
