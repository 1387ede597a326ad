//! The materialized state a resource commits into.
//!
//! A resource hands every block's effective versions to its [`Snapshot`]
//! once the block is ordered. Versions that later blocks already overwrite
//! are masked out before the hand-off, so applying commits in any arrival
//! order yields the same values.

use std::collections::BTreeMap;

use bytes::Bytes;
use dashmap::DashMap;
use weft_core::{ObjectId, Tick, VersionSet};

pub trait Snapshot: Send + Sync {
    /// Apply the versions of a newly ordered block.
    fn merge(&self, resource: &str, tick: Tick, versions: &VersionSet);

    /// Forget everything held for `resource`.
    fn clear(&self, _resource: &str) {}
}

/// Snapshot kept in process memory, one object map per resource.
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    resources: DashMap<String, BTreeMap<ObjectId, (Tick, Bytes)>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &str, object: ObjectId) -> Option<Bytes> {
        self.resources
            .get(resource)
            .and_then(|objects| objects.get(&object).map(|(_, v)| v.clone()))
    }

    /// Tick of the block that last wrote `object`.
    pub fn writer(&self, resource: &str, object: ObjectId) -> Option<Tick> {
        self.resources
            .get(resource)
            .and_then(|objects| objects.get(&object).map(|(t, _)| *t))
    }

    pub fn values(&self, resource: &str) -> BTreeMap<ObjectId, Bytes> {
        self.resources
            .get(resource)
            .map(|objects| {
                objects
                    .iter()
                    .map(|(object, (_, value))| (*object, value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Snapshot for MemorySnapshot {
    fn merge(&self, resource: &str, tick: Tick, versions: &VersionSet) {
        if versions.is_empty() {
            return;
        }
        let mut objects = self.resources.entry(resource.to_string()).or_default();
        for (object, value) in versions.iter() {
            objects.insert(object, (tick, value.clone()));
        }
    }

    fn clear(&self, resource: &str) {
        self.resources.remove(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{Peer, PeerUid};

    fn tick(time: u64) -> Tick {
        Tick::new(Peer::get_or_create(PeerUid::derive("snapshot")).unwrap(), time).unwrap()
    }

    #[test]
    fn test_merge_overwrites_per_object() {
        let snapshot = MemorySnapshot::new();
        let mut first = VersionSet::new();
        first.insert(1, Bytes::from_static(b"a"));
        first.insert(2, Bytes::from_static(b"b"));
        snapshot.merge("doc", tick(1), &first);

        let mut second = VersionSet::new();
        second.insert(2, Bytes::from_static(b"c"));
        snapshot.merge("doc", tick(2), &second);

        assert_eq!(snapshot.get("doc", 1).unwrap(), Bytes::from_static(b"a"));
        assert_eq!(snapshot.get("doc", 2).unwrap(), Bytes::from_static(b"c"));
        assert_eq!(snapshot.writer("doc", 2), Some(tick(2)));
        assert!(snapshot.values("other").is_empty());
    }

    #[test]
    fn test_clear() {
        let snapshot = MemorySnapshot::new();
        let mut versions = VersionSet::new();
        versions.insert(1, Bytes::from_static(b"a"));
        snapshot.merge("doc", tick(1), &versions);
        snapshot.clear("doc");
        assert!(snapshot.get("doc", 1).is_none());
    }
}
