//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use bytes::Bytes;

use weft::{ClockMode, Workspace, WorkspaceConfig};
use weft_core::{Block, BlockBody, MaxTickMap, ObjectId, Peer, PeerUid, Tick, TickSet, VersionSet};
use weft_perms::PermissionPolicy;
use weft_store::MemoryStore;
use weft_sync::{
    ConnectionEngine, MemoryNetwork, MemoryOrigin, Server, SyncConfig, Upstream, UriRegistry,
};

/// The peer derived from `seed`. The same seed always names the same peer.
pub fn peer(seed: &str) -> Peer {
    Peer::get_or_create(PeerUid::derive(seed)).expect("peer registry full")
}

pub fn tick(seed: &str, time: u64) -> Tick {
    Tick::new(peer(seed), time).expect("time out of range")
}

/// A version set from `(object, value)` pairs.
pub fn versions(pairs: &[(ObjectId, &str)]) -> VersionSet {
    pairs
        .iter()
        .map(|(object, value)| (*object, Bytes::copy_from_slice(value.as_bytes())))
        .collect()
}

/// A block with no causal past writing `pairs`.
pub fn block(t: Tick, pairs: &[(ObjectId, &str)]) -> Block {
    BlockBuilder::new(t).writes(pairs).build()
}

/// Builds blocks with explicit causal metadata.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    tick: Tick,
    body: BlockBody,
}

impl BlockBuilder {
    pub fn new(tick: Tick) -> Self {
        Self {
            tick,
            body: BlockBody {
                generation: 1,
                ..Default::default()
            },
        }
    }

    pub fn deps(mut self, deps: &[Tick]) -> Self {
        self.body.deps = deps.iter().copied().collect();
        self
    }

    /// Record `ticks` in the happened-before vector.
    pub fn after(mut self, ticks: &[Tick]) -> Self {
        for t in ticks {
            self.body.happened_before.put_max(*t);
        }
        self
    }

    pub fn generation(mut self, generation: u64) -> Self {
        self.body.generation = generation;
        self
    }

    pub fn writes(mut self, pairs: &[(ObjectId, &str)]) -> Self {
        self.body.versions = versions(pairs);
        self
    }

    pub fn body(&self) -> &BlockBody {
        &self.body
    }

    pub fn build(self) -> Block {
        Block::from_body(self.tick, &self.body).expect("body encodes")
    }
}

/// An origin server over a fresh memory store.
pub fn origin(policy: Arc<dyn PermissionPolicy>) -> (Arc<MemoryStore>, Arc<Server>) {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(UriRegistry::new(vec![Arc::new(MemoryOrigin::new(
        "",
        store.clone(),
    ))]));
    let server = Server::new(registry, policy, SyncConfig::default());
    (store, server)
}

/// A workspace for peer `seed` whose only location is one upstream.
///
/// The upstream's transport leads nowhere: connect it to a server with
/// [`Link`] instead of starting it.
pub fn client_workspace(seed: &str) -> Workspace {
    Workspace::builder()
        .peer(peer(seed))
        .config(WorkspaceConfig {
            clock: ClockMode::Logical,
            ..WorkspaceConfig::default()
        })
        .upstream("", Arc::new(MemoryNetwork::new().transport("nowhere")))
        .build()
        .expect("workspace config is valid")
}

/// Move bytes between two engines until neither has anything to send.
/// Returns the number of buffers moved.
pub fn pump(a: &mut ConnectionEngine, b: &mut ConnectionEngine) -> weft_sync::Result<usize> {
    let mut moved = 0;
    loop {
        let before = moved;
        while let Some(bytes) = a.transmit()? {
            b.receive(&bytes)?;
            moved += 1;
        }
        while let Some(bytes) = b.transmit()? {
            a.receive(&bytes)?;
            moved += 1;
        }
        if moved == before {
            return Ok(moved);
        }
    }
}

/// An in-memory connection between an upstream and a server, driven by
/// hand instead of by tasks.
pub struct Link {
    pub client: ConnectionEngine,
    pub server: ConnectionEngine,
}

impl Link {
    pub fn new(upstream: &Arc<Upstream>, server: &Arc<Server>) -> Self {
        Self {
            client: upstream.connect_engine(),
            server: server.engine(),
        }
    }

    pub fn pump(&mut self) -> weft_sync::Result<usize> {
        pump(&mut self.client, &mut self.server)
    }

    /// Tear down both ends.
    pub fn close(mut self) {
        self.client.shutdown();
        self.server.shutdown();
    }

    /// Pump every link until all of them are quiet. Blocks one link
    /// delivers can queue traffic on another.
    pub fn pump_all(links: &mut [Link]) -> weft_sync::Result<usize> {
        let mut total = 0;
        loop {
            let mut moved = 0;
            for link in links.iter_mut() {
                moved += link.pump()?;
            }
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }
}

/// Set of ticks for assertions.
pub fn tick_set(ticks: &[Tick]) -> TickSet {
    ticks.iter().copied().collect()
}

/// Vector clock holding `ticks`.
pub fn max_ticks(ticks: &[Tick]) -> MaxTickMap {
    ticks.iter().copied().collect()
}
