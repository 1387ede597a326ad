//! Per-peer maximum tick map: a compact vector clock.

use std::fmt;

use crate::slots::{Slot, Slots};
use crate::tick::Tick;

fn peer_key(entry: u64) -> u64 {
    Tick::from_raw(entry).peer_index() as u64
}

/// Open-addressed map from peer to the highest tick seen from that peer.
#[derive(Clone, Default)]
pub struct MaxTickMap {
    slots: Slots,
}

impl MaxTickMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    /// Highest tick recorded for `peer_index`.
    pub fn get(&self, peer_index: u32) -> Option<Tick> {
        match self.slots.find(peer_index as u64, peer_key) {
            Slot::Found(i) => Some(Tick::from_raw(self.slots.get(i))),
            Slot::Vacant(_) => None,
        }
    }

    /// Record `tick` if it is later than the current entry for its peer.
    /// Returns true if the map changed.
    pub fn put_max(&mut self, tick: Tick) -> bool {
        if !tick.is_valid() {
            return false;
        }
        match self.slots.find(tick.peer_index() as u64, peer_key) {
            Slot::Found(i) => {
                if Tick::from_raw(self.slots.get(i)).time() < tick.time() {
                    self.slots.set(i, tick.raw());
                    true
                } else {
                    false
                }
            }
            Slot::Vacant(_) => {
                self.slots.insert(tick.raw(), peer_key);
                true
            }
        }
    }

    pub fn remove(&mut self, peer_index: u32) -> Option<Tick> {
        match self.slots.find(peer_index as u64, peer_key) {
            Slot::Found(i) => Some(Tick::from_raw(self.slots.remove_at(i))),
            Slot::Vacant(_) => None,
        }
    }

    /// True if `tick` happened before (or at) this map's entry for its peer.
    pub fn dominates(&self, tick: Tick) -> bool {
        tick.happened_before(self)
    }

    /// True if every entry in `other` is dominated by this map.
    pub fn dominates_all(&self, other: &MaxTickMap) -> bool {
        other.iter().all(|t| self.dominates(t))
    }

    pub fn merge(&mut self, other: &MaxTickMap) {
        for tick in other.iter() {
            self.put_max(tick);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Tick> + '_ {
        self.slots.iter().map(Tick::from_raw)
    }
}

impl PartialEq for MaxTickMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|t| other.get(t.peer_index()) == Some(t))
    }
}

impl Eq for MaxTickMap {}

impl fmt::Debug for MaxTickMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ticks: Vec<Tick> = self.iter().collect();
        ticks.sort_unstable();
        f.debug_set().entries(ticks).finish()
    }
}

impl FromIterator<Tick> for MaxTickMap {
    fn from_iter<I: IntoIterator<Item = Tick>>(iter: I) -> Self {
        let mut map = MaxTickMap::new();
        for tick in iter {
            map.put_max(tick);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Peer, PeerUid};

    fn peer(seed: &str) -> Peer {
        Peer::get_or_create(PeerUid::derive(seed)).unwrap()
    }

    #[test]
    fn test_put_max_keeps_highest() {
        let p = peer("max");
        let mut map = MaxTickMap::new();
        assert!(map.put_max(Tick::new(p, 5).unwrap()));
        assert!(!map.put_max(Tick::new(p, 3).unwrap()));
        assert!(map.put_max(Tick::new(p, 9).unwrap()));
        assert_eq!(map.get(p.index()).unwrap().time(), 9);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_one_slot_per_peer() {
        let mut map = MaxTickMap::new();
        for i in 0..100 {
            let p = peer(&format!("slot-{i}"));
            map.put_max(Tick::new(p, 1).unwrap());
            map.put_max(Tick::new(p, 2).unwrap());
        }
        assert_eq!(map.len(), 100);
    }

    #[test]
    fn test_dominates_all() {
        let a = peer("dom-a");
        let b = peer("dom-b");
        let big: MaxTickMap = [Tick::new(a, 10).unwrap(), Tick::new(b, 10).unwrap()]
            .into_iter()
            .collect();
        let small: MaxTickMap = [Tick::new(a, 3).unwrap()].into_iter().collect();
        assert!(big.dominates_all(&small));
        assert!(!small.dominates_all(&big));
        assert!(big.dominates_all(&MaxTickMap::new()));
    }

    #[test]
    fn test_remove_peer() {
        let p = peer("remove-peer");
        let mut map = MaxTickMap::new();
        map.put_max(Tick::new(p, 4).unwrap());
        assert_eq!(map.remove(p.index()).unwrap().time(), 4);
        assert!(map.get(p.index()).is_none());
        assert!(!Tick::new(p, 1).unwrap().happened_before(&map));
    }
}
