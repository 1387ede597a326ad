//! Store-backed view.
//!
//! As an origin it is the durable home of a resource: every stored block is
//! acknowledged. As a cache it keeps copies to answer fetches locally and
//! never acknowledges. In both roles a block's removal set stubs the blocks
//! it supersedes.

use std::sync::Arc;

use weft_core::{Block, Tick, TickSet};
use weft_store::{PutResult, Store, StoreExt};

use crate::in_flight::next_actor_id;
use crate::uri::{Origin, Uri, UriHandler};
use crate::view::View;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRole {
    Origin,
    Cache,
}

pub struct MemoryView {
    id: u64,
    role: MemoryRole,
    store: Arc<dyn Store>,
}

impl MemoryView {
    pub fn new(role: MemoryRole, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            id: next_actor_id(),
            role,
            store,
        })
    }

    pub fn role(&self) -> MemoryRole {
        self.role
    }

    fn stub_removals(&self, uri: &Uri, removals: &TickSet) {
        for removed in removals.iter() {
            if let Err(e) = self.store.stub_out(uri.name(), removed) {
                tracing::warn!(resource = uri.name(), %removed, error = %e, "failed to stub superseded block");
            }
        }
    }
}

impl View for MemoryView {
    fn view_id(&self) -> u64 {
        self.id
    }

    fn get_known(&self, uri: &Arc<Uri>) {
        match self.store.known(uri.name()) {
            Ok(known) => uri.publish_known(&known, self.id),
            Err(e) => tracing::warn!(resource = uri.name(), error = %e, "failed to list known ticks"),
        }
    }

    fn on_known(&self, _uri: &Arc<Uri>, _ticks: &TickSet, _source: u64) {}

    fn get_block(&self, uri: &Arc<Uri>, tick: Tick) {
        match self.store.get(uri.name(), tick) {
            Ok(Some(payload)) => {
                uri.deliver(&Block::new(tick, payload));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(resource = uri.name(), %tick, error = %e, "store read failed"),
        }
    }

    fn on_block(&self, uri: &Arc<Uri>, block: &Block, origin: Origin) {
        if origin.source == self.id {
            return;
        }
        let stored = match self.store.put(uri.name(), block.tick, block.payload()) {
            Ok(PutResult::Inserted) => true,
            Ok(PutResult::AlreadyExists) => false,
            Err(e) => {
                tracing::warn!(resource = uri.name(), tick = %block.tick, error = %e, "store write failed");
                return;
            }
        };
        if let Some(removals) = &block.removals {
            self.stub_removals(uri, removals);
        }
        if stored {
            tracing::trace!(resource = uri.name(), tick = %block.tick, role = ?self.role, "block stored");
        }
        if self.role == MemoryRole::Origin {
            uri.publish_ack(block.tick, self.id);
        }
    }

    fn acknowledges(&self) -> bool {
        self.role == MemoryRole::Origin
    }

    fn stored_known(&self, uri: &Uri) -> Option<TickSet> {
        self.store.known(uri.name()).ok()
    }

    fn read_block(&self, uri: &Uri, tick: Tick) -> Option<Block> {
        self.store
            .get(uri.name(), tick)
            .ok()
            .flatten()
            .map(|payload| Block::new(tick, payload))
    }
}

/// Handler that backs every name under a prefix with a [`MemoryView`].
pub struct MemoryOrigin {
    prefix: String,
    role: MemoryRole,
    store: Arc<dyn Store>,
}

impl MemoryOrigin {
    pub fn new(prefix: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            role: MemoryRole::Origin,
            store,
        }
    }

    pub fn cache(prefix: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            role: MemoryRole::Cache,
            store,
        }
    }
}

impl UriHandler for MemoryOrigin {
    fn views(&self, name: &str) -> Option<Vec<Arc<dyn View>>> {
        name.starts_with(&self.prefix)
            .then(|| vec![MemoryView::new(self.role, self.store.clone()) as Arc<dyn View>])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_flight::{BlockRequester, InFlight};
    use crate::uri::UriListener;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use weft_core::{BlockBody, Peer, PeerUid, VersionSet};
    use weft_perms::Permission;
    use weft_store::MemoryStore;

    fn tick(time: u64) -> Tick {
        Tick::new(Peer::get_or_create(PeerUid::derive("memory-view")).unwrap(), time).unwrap()
    }

    fn block(time: u64, object: u64) -> Block {
        let mut versions = VersionSet::new();
        versions.insert(object, Bytes::from(format!("v{time}")));
        let body = BlockBody {
            generation: time,
            versions,
            ..Default::default()
        };
        Block::from_body(tick(time), &body).unwrap()
    }

    #[derive(Default)]
    struct Listener {
        id: u64,
        known: Mutex<Vec<usize>>,
        acks: Mutex<Vec<Tick>>,
        fetched: Mutex<Vec<Tick>>,
    }

    impl Listener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_actor_id(),
                ..Default::default()
            })
        }
    }

    impl UriListener for Listener {
        fn listener_id(&self) -> u64 {
            self.id
        }
        fn on_known(&self, _uri: &Arc<Uri>, ticks: &TickSet, _source: u64) {
            self.known.lock().push(ticks.len());
        }
        fn on_block(&self, _uri: &Arc<Uri>, _block: &Block, _origin: Origin) {}
        fn on_ack(&self, _uri: &Arc<Uri>, tick: Tick, _source: u64) {
            self.acks.lock().push(tick);
        }
        fn on_permission(&self, _uri: &Arc<Uri>, _p: Permission, _source: u64) {}
        fn on_unresolved(&self, _uri: &Arc<Uri>, _source: u64) {}
        fn known(&self) -> TickSet {
            TickSet::new()
        }
        fn local_block(&self, _tick: Tick) -> Option<Block> {
            None
        }
    }

    impl BlockRequester for Listener {
        fn requester_id(&self) -> u64 {
            self.id
        }
        fn on_block(&self, block: &Block) {
            self.fetched.lock().push(block.tick);
        }
        fn failed(&self, _tick: Tick, _reason: &str) {}
    }

    fn hub(role: MemoryRole) -> (Arc<Uri>, Arc<MemoryStore>, Arc<Listener>) {
        let store = Arc::new(MemoryStore::new());
        let view = MemoryView::new(role, store.clone());
        let uri = Uri::new("doc", Arc::new(InFlight::new()), vec![view as Arc<dyn View>]);
        let listener = Listener::new();
        uri.add_listener(listener.clone());
        (uri, store, listener)
    }

    #[test]
    fn test_origin_stores_and_acks() {
        let (uri, store, listener) = hub(MemoryRole::Origin);
        uri.publish_block(&block(1, 1), Origin::local(listener.id));
        assert!(store.contains("doc", tick(1)).unwrap());
        assert_eq!(*listener.acks.lock(), vec![tick(1)]);

        // Duplicate upload is acknowledged again.
        uri.publish_block(&block(1, 1), Origin::local(listener.id));
        assert_eq!(listener.acks.lock().len(), 2);
    }

    #[test]
    fn test_cache_does_not_ack() {
        let (uri, store, listener) = hub(MemoryRole::Cache);
        uri.publish_block(&block(1, 1), Origin::local(listener.id));
        assert!(store.contains("doc", tick(1)).unwrap());
        assert!(listener.acks.lock().is_empty());
        assert!(uri.acknowledging_views().is_empty());
    }

    #[test]
    fn test_removals_stub_superseded() {
        let (uri, store, listener) = hub(MemoryRole::Origin);
        uri.publish_block(&block(1, 1), Origin::local(listener.id));
        let removals: TickSet = [tick(1)].into_iter().collect();
        uri.publish_block(&block(2, 1).with_removals(removals), Origin::local(listener.id));

        let stub = BlockBody::decode(&store.get("doc", tick(1)).unwrap().unwrap()).unwrap();
        assert!(stub.versions.is_empty());
        assert_eq!(stub.generation, 1);
    }

    #[test]
    fn test_get_known_and_get_block() {
        let (uri, _store, listener) = hub(MemoryRole::Origin);
        uri.publish_block(&block(1, 1), Origin::local(listener.id));
        uri.publish_block(&block(2, 2), Origin::local(listener.id));

        uri.get_known();
        assert_eq!(*listener.known.lock(), vec![2]);

        let in_flight = uri.in_flight().clone();
        in_flight.get(uri.id(), tick(2), listener.clone(), || uri.fetch(tick(2)));
        assert_eq!(*listener.fetched.lock(), vec![tick(2)]);
        assert!(uri.local_block(tick(1)).is_some());
        assert!(uri.local_block(tick(9)).is_none());
    }

    #[test]
    fn test_handler_matches_prefix() {
        let origin = MemoryOrigin::new("docs/", Arc::new(MemoryStore::new()));
        assert!(origin.views("docs/a").is_some());
        assert!(origin.views("other").is_none());
    }
}
