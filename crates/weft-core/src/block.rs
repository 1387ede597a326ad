//! Blocks: the immutable unit of replication.
//!
//! A [`Block`] is what travels between locations: a tick, opaque payload
//! buffers, an optional removal set and the requested flag. The payload
//! itself encodes a [`BlockBody`] with the causal metadata the resource needs
//! to place the block: dependencies, the writer's happened-before vector, a
//! Lamport generation and the written [`VersionSet`].

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::codec::{Progress, ReadCursor, TickSetDecoder, TickSetEncoder, WriteCursor};
use crate::error::CodecError;
use crate::max_tick::MaxTickMap;
use crate::tick::Tick;
use crate::tick_set::TickSet;

/// Identifier of one versioned object inside a resource.
pub type ObjectId = u64;

/// Object versions written by one block. Values are opaque to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionSet(BTreeMap<ObjectId, Bytes>);

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: ObjectId, value: impl Into<Bytes>) -> Option<Bytes> {
        self.0.insert(object, value.into())
    }

    pub fn get(&self, object: ObjectId) -> Option<&Bytes> {
        self.0.get(&object)
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.0.contains_key(&object)
    }

    pub fn remove(&mut self, object: ObjectId) -> Option<Bytes> {
        self.0.remove(&object)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Bytes)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    /// True if any object is written by both sets.
    pub fn overlaps(&self, other: &VersionSet) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.objects().any(|o| large.contains(o))
    }

    /// Drop every object that `newer` also writes. Returns the number of
    /// objects dropped.
    pub fn mask(&mut self, newer: &VersionSet) -> usize {
        let before = self.0.len();
        self.0.retain(|object, _| !newer.contains(*object));
        before - self.0.len()
    }

    /// Overwrite with every version in `other`.
    pub fn merge(&mut self, other: &VersionSet) {
        for (object, value) in other.iter() {
            self.0.insert(object, value.clone());
        }
    }
}

impl FromIterator<(ObjectId, Bytes)> for VersionSet {
    fn from_iter<I: IntoIterator<Item = (ObjectId, Bytes)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Causal metadata and versions carried inside a block's payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockBody {
    /// Ticks that must be applied before this one.
    pub deps: TickSet,
    /// The writer's loaded vector at write time.
    pub happened_before: MaxTickMap,
    /// One more than the highest generation in the writer's causal past.
    pub generation: u64,
    pub versions: VersionSet,
}

fn complete<T>(p: Progress<T>) -> Result<T, CodecError> {
    p.done().ok_or(CodecError::Truncated)
}

impl BlockBody {
    /// Encode to a standalone buffer. Peer back-references are scoped to
    /// the body.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut cur = WriteCursor::unbounded();
        complete(TickSetEncoder::new(&self.deps).encode(&mut cur)?)?;
        let mut hb: Vec<Tick> = self.happened_before.iter().collect();
        hb.sort_unstable();
        complete(TickSetEncoder::from_ticks(hb).encode(&mut cur)?)?;
        cur.put_u64(self.generation);
        cur.put_u32(self.versions.len() as u32);
        for (object, value) in self.versions.iter() {
            cur.put_u64(object);
            cur.put_u32(value.len() as u32);
            cur.put_slice(value);
        }
        Ok(cur.take())
    }

    /// Decode a body that must occupy `bytes` exactly.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cur = ReadCursor::new();
        cur.feed(bytes);

        let deps = complete(TickSetDecoder::new().decode(&mut cur)?)?;
        let happened_before = complete(TickSetDecoder::new().decode(&mut cur)?)?
            .iter()
            .collect();
        let generation = cur.try_u64().ok_or(CodecError::Truncated)?;
        let count = cur.try_u32().ok_or(CodecError::Truncated)?;

        let mut versions = VersionSet::new();
        for _ in 0..count {
            let object = cur.try_u64().ok_or(CodecError::Truncated)?;
            let len = cur.try_u32().ok_or(CodecError::Truncated)?;
            let value = cur.try_bytes(len as usize).ok_or(CodecError::Truncated)?;
            versions.insert(object, value);
        }

        if cur.remaining() > 0 {
            return Err(CodecError::TrailingBytes(cur.remaining()));
        }

        Ok(Self {
            deps,
            happened_before,
            generation,
            versions,
        })
    }

    /// The same causal metadata with no versions. Stored in place of a
    /// block whose objects were all superseded.
    pub fn stub(&self) -> Self {
        Self {
            deps: self.deps.clone(),
            happened_before: self.happened_before.clone(),
            generation: self.generation,
            versions: VersionSet::new(),
        }
    }
}

/// One block as exchanged between locations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub tick: Tick,
    /// Payload, possibly split across several buffers.
    pub buffers: Vec<Bytes>,
    /// Older ticks this block fully supersedes.
    pub removals: Option<TickSet>,
    /// Whether this delivery answers an explicit request on this connection.
    pub requested: bool,
}

impl Block {
    pub fn new(tick: Tick, payload: Bytes) -> Self {
        Self {
            tick,
            buffers: vec![payload],
            removals: None,
            requested: false,
        }
    }

    /// Encode `body` as the payload of a new block.
    pub fn from_body(tick: Tick, body: &BlockBody) -> Result<Self, CodecError> {
        Ok(Self::new(tick, body.encode()?))
    }

    pub fn with_removals(mut self, removals: TickSet) -> Self {
        self.removals = (!removals.is_empty()).then_some(removals);
        self
    }

    pub fn with_requested(mut self, requested: bool) -> Self {
        self.requested = requested;
        self
    }

    /// Total payload length.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload as one contiguous buffer.
    pub fn payload(&self) -> Bytes {
        match self.buffers.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut merged = BytesMut::with_capacity(self.len());
                for buf in many {
                    merged.extend_from_slice(buf);
                }
                merged.freeze()
            }
        }
    }

    /// Decode the body. Fails if the payload is not exactly one body.
    pub fn body(&self) -> Result<BlockBody, CodecError> {
        BlockBody::decode(&self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Peer, PeerUid};

    fn tick(seed: &str, time: u64) -> Tick {
        Tick::new(Peer::get_or_create(PeerUid::derive(seed)).unwrap(), time).unwrap()
    }

    fn sample_body() -> BlockBody {
        let mut versions = VersionSet::new();
        versions.insert(1, Bytes::from_static(b"one"));
        versions.insert(7, Bytes::from_static(b"seven"));
        BlockBody {
            deps: [tick("body-a", 3)].into_iter().collect(),
            happened_before: [tick("body-a", 3), tick("body-b", 9)].into_iter().collect(),
            generation: 4,
            versions,
        }
    }

    #[test]
    fn test_body_roundtrip() {
        let body = sample_body();
        let bytes = body.encode().unwrap();
        assert_eq!(BlockBody::decode(&bytes).unwrap(), body);
    }

    #[test]
    fn test_body_rejects_truncation() {
        let bytes = sample_body().encode().unwrap();
        for cut in 0..bytes.len() {
            assert!(BlockBody::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_body_rejects_trailing_bytes() {
        let mut bytes = sample_body().encode().unwrap().to_vec();
        bytes.push(0);
        assert_eq!(BlockBody::decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_payload_merges_buffers() {
        let bytes = sample_body().encode().unwrap();
        let mut block = Block::new(tick("body-a", 10), Bytes::new());
        block.buffers = bytes.chunks(5).map(Bytes::copy_from_slice).collect();
        assert_eq!(block.len(), bytes.len());
        assert_eq!(block.payload(), bytes);
        assert_eq!(block.body().unwrap(), sample_body());
    }

    #[test]
    fn test_mask() {
        let mut older = sample_body().versions;
        let mut newer = VersionSet::new();
        newer.insert(7, Bytes::from_static(b"new"));
        assert!(older.overlaps(&newer));
        assert_eq!(older.mask(&newer), 1);
        assert_eq!(older.objects().collect::<Vec<_>>(), vec![1]);
        assert!(!older.overlaps(&newer));
    }

    #[test]
    fn test_stub_keeps_causality() {
        let body = sample_body();
        let stub = body.stub();
        assert!(stub.versions.is_empty());
        assert_eq!(stub.deps, body.deps);
        assert_eq!(stub.generation, body.generation);
    }

    #[test]
    fn test_empty_removals_are_none() {
        let block = Block::new(tick("body-a", 1), Bytes::new()).with_removals(TickSet::new());
        assert!(block.removals.is_none());
    }
}
