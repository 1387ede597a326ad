//! In-memory implementation of the Store trait.
//!
//! Used for origins and caches in tests and for ephemeral servers. Nothing
//! survives a drop.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use weft_core::{Tick, TickSet};

use crate::error::Result;
use crate::traits::{PutResult, Store};

/// In-memory store implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Table>>,
}

#[derive(Default)]
struct Table {
    blocks: HashMap<Tick, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored blocks across all resources.
    pub fn block_count(&self) -> usize {
        self.inner.read().values().map(|t| t.blocks.len()).sum()
    }
}

impl Store for MemoryStore {
    fn put(&self, resource: &str, tick: Tick, payload: Bytes) -> Result<PutResult> {
        let mut inner = self.inner.write();
        let table = inner.entry(resource.to_string()).or_default();
        if table.blocks.contains_key(&tick) {
            return Ok(PutResult::AlreadyExists);
        }
        table.blocks.insert(tick, payload);
        tracing::trace!(resource, %tick, "stored block");
        Ok(PutResult::Inserted)
    }

    fn get(&self, resource: &str, tick: Tick) -> Result<Option<Bytes>> {
        let inner = self.inner.read();
        Ok(inner
            .get(resource)
            .and_then(|t| t.blocks.get(&tick))
            .cloned())
    }

    fn replace(&self, resource: &str, tick: Tick, payload: Bytes) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.get_mut(resource).and_then(|t| t.blocks.get_mut(&tick)) {
            Some(slot) => {
                *slot = payload;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, resource: &str, tick: Tick) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(table) = inner.get_mut(resource) else {
            return Ok(false);
        };
        let removed = table.blocks.remove(&tick).is_some();
        if table.blocks.is_empty() {
            inner.remove(resource);
        }
        Ok(removed)
    }

    fn known(&self, resource: &str) -> Result<TickSet> {
        let inner = self.inner.read();
        Ok(inner
            .get(resource)
            .map(|t| t.blocks.keys().copied().collect())
            .unwrap_or_default())
    }

    fn resources(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use weft_core::{BlockBody, Peer, PeerUid, VersionSet};

    fn tick(time: u64) -> Tick {
        Tick::new(Peer::get_or_create(PeerUid::derive("memory-store")).unwrap(), time).unwrap()
    }

    fn body(object: u64, value: &'static [u8]) -> Bytes {
        let mut versions = VersionSet::new();
        versions.insert(object, Bytes::from_static(value));
        BlockBody {
            generation: 1,
            versions,
            ..Default::default()
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = MemoryStore::new();
        assert_eq!(store.put("r", tick(1), body(1, b"a")).unwrap(), PutResult::Inserted);
        assert_eq!(store.put("r", tick(1), body(1, b"b")).unwrap(), PutResult::AlreadyExists);
        assert_eq!(store.get("r", tick(1)).unwrap().unwrap(), body(1, b"a"));
    }

    #[test]
    fn test_known_is_per_resource() {
        let store = MemoryStore::new();
        store.put("a", tick(1), body(1, b"x")).unwrap();
        store.put("a", tick(2), body(1, b"y")).unwrap();
        store.put("b", tick(3), body(1, b"z")).unwrap();

        let known = store.known("a").unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.contains(tick(1)) && known.contains(tick(2)));
        assert!(store.known("missing").unwrap().is_empty());
        assert_eq!(store.resources().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_stub_out_keeps_tick_known() {
        let store = MemoryStore::new();
        store.put("r", tick(1), body(9, b"old")).unwrap();
        assert!(store.stub_out("r", tick(1)).unwrap());

        let stored = BlockBody::decode(&store.get("r", tick(1)).unwrap().unwrap()).unwrap();
        assert!(stored.versions.is_empty());
        assert_eq!(stored.generation, 1);
        assert!(store.known("r").unwrap().contains(tick(1)));
        assert!(!store.stub_out("r", tick(2)).unwrap());
    }

    #[test]
    fn test_remove_drops_empty_resource() {
        let store = MemoryStore::new();
        store.put("r", tick(1), body(1, b"a")).unwrap();
        assert!(store.remove("r", tick(1)).unwrap());
        assert!(!store.remove("r", tick(1)).unwrap());
        assert!(store.resources().unwrap().is_empty());
        assert_eq!(store.block_count(), 0);
    }
}
