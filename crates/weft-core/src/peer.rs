//! Peer identity and the process-wide peer registry.
//!
//! A peer is a 16-byte UID interned to a dense 24-bit index. Ticks carry the
//! index; the wire carries the UID. The registry is initialised lazily and
//! lives for the whole process.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::RngCore;

use crate::error::{CoreError, Result};

/// A 16-byte globally unique peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerUid(pub [u8; 16]);

impl PeerUid {
    /// Length of a UID on the wire.
    pub const LEN: usize = 16;

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Generate a fresh random UID.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a UID deterministically from a seed string.
    ///
    /// Used by tests and fixtures that need stable peer ordering.
    pub fn derive(seed: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"weft-peer-v0:");
        hasher.update(seed.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PeerUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerUid({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PeerUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// An interned peer: UID plus its dense local index.
///
/// Indices are local to this process and start at 1; index 0 is reserved
/// for [`Tick::NONE`](crate::Tick::NONE).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    uid: PeerUid,
    index: u32,
}

impl Peer {
    /// Highest assignable index. The all-ones index is reserved for
    /// [`Tick::REMOVED`](crate::Tick::REMOVED).
    pub const MAX_INDEX: u32 = (1 << 24) - 2;

    /// Intern a UID, assigning a new index on first sight.
    pub fn get_or_create(uid: PeerUid) -> Result<Peer> {
        registry().get_or_create(uid)
    }

    /// Intern a fresh random peer.
    pub fn random() -> Result<Peer> {
        Self::get_or_create(PeerUid::random())
    }

    /// Look up a previously interned peer.
    pub fn from_index(index: u32) -> Option<Peer> {
        registry().lookup(index)
    }

    pub fn uid(&self) -> PeerUid {
        self.uid
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}#{})", self.uid, self.index)
    }
}

struct Registry {
    by_uid: DashMap<PeerUid, u32>,
    by_index: RwLock<Vec<Option<PeerUid>>>,
    next: AtomicU32,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        by_uid: DashMap::new(),
        by_index: RwLock::new(vec![None]),
        next: AtomicU32::new(1),
    })
}

impl Registry {
    fn get_or_create(&self, uid: PeerUid) -> Result<Peer> {
        if let Some(index) = self.by_uid.get(&uid) {
            return Ok(Peer { uid, index: *index });
        }

        // The vacant entry holds the shard lock, so two racing creators of
        // the same UID cannot both allocate an index.
        match self.by_uid.entry(uid) {
            Entry::Occupied(e) => Ok(Peer {
                uid,
                index: *e.get(),
            }),
            Entry::Vacant(v) => {
                let index = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n <= Peer::MAX_INDEX).then_some(n + 1)
                    })
                    .map_err(|_| CoreError::PeerSpaceExhausted)?;

                {
                    let mut by_index = self.by_index.write();
                    let slot = index as usize;
                    if by_index.len() <= slot {
                        by_index.resize(slot + 1, None);
                    }
                    by_index[slot] = Some(uid);
                }

                v.insert(index);
                Ok(Peer { uid, index })
            }
        }
    }

    fn lookup(&self, index: u32) -> Option<Peer> {
        let by_index = self.by_index.read();
        by_index
            .get(index as usize)
            .copied()
            .flatten()
            .map(|uid| Peer { uid, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let uid = PeerUid::derive("idempotent");
        let a = Peer::get_or_create(uid).unwrap();
        let b = Peer::get_or_create(uid).unwrap();
        assert_eq!(a, b);
        assert!(a.index() >= 1);
    }

    #[test]
    fn test_distinct_uids_get_distinct_indices() {
        let a = Peer::get_or_create(PeerUid::derive("distinct-a")).unwrap();
        let b = Peer::get_or_create(PeerUid::derive("distinct-b")).unwrap();
        assert_ne!(a.index(), b.index());
    }

    #[test]
    fn test_from_index_resolves_uid() {
        let peer = Peer::random().unwrap();
        let found = Peer::from_index(peer.index()).unwrap();
        assert_eq!(found.uid(), peer.uid());
        assert!(Peer::from_index(0).is_none());
    }

    #[test]
    fn test_concurrent_creation_agrees() {
        let uid = PeerUid::derive("racing");
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(move || Peer::get_or_create(uid).unwrap().index()))
            .collect();
        let indices: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(indices.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_uid_hex_roundtrip() {
        let uid = PeerUid::derive("hex");
        assert_eq!(PeerUid::from_hex(&uid.to_hex()).unwrap(), uid);
        assert_eq!(format!("{}", uid).len(), 16);
        assert!(PeerUid::from_hex("abcd").is_err());
    }
}
