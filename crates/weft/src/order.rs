//! Ordering and masking of applied blocks.
//!
//! Blocks are kept in a total order that extends causality. Concurrent
//! blocks are ordered by writer uid, then by time, the same way on every
//! peer. An explicit causal link (a named dependency, a later tick from the
//! same peer, or a dominating happened-before vector) overrides that key.
//!
//! The order is the greedy linear extension of the causal order: at every
//! step the block with the smallest key among those whose causal past is
//! already placed comes next. Blocks are only applied once their causal
//! past is, so a new block never precedes anything already applied, and
//! inserting it never moves the others relative to each other. The result
//! depends only on the set of applied blocks, not on their arrival order.
//!
//! When a block is inserted, every earlier block loses the objects the new
//! block writes, and the new block loses the objects later blocks write.
//! A block left with no objects stops being visible, but keeps its place so
//! later insertions still see where its causal successors may start.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use bytes::Bytes;
use weft_core::{BlockBody, CoreError, MaxTickMap, ObjectId, PeerUid, Tick, TickSet, VersionSet};

/// A block in a resource's ordered list, with its versions already masked
/// by everything ordered after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedBlock {
    pub tick: Tick,
    pub uid: PeerUid,
    pub generation: u64,
    pub deps: TickSet,
    pub happened_before: MaxTickMap,
    pub versions: VersionSet,
}

impl OrderedBlock {
    pub fn new(tick: Tick, body: BlockBody) -> Result<Self, CoreError> {
        let peer = tick
            .peer()
            .ok_or(CoreError::UnknownPeer(tick.peer_index()))?;
        Ok(Self {
            tick,
            uid: peer.uid(),
            generation: body.generation,
            deps: body.deps,
            happened_before: body.happened_before,
            versions: body.versions,
        })
    }

    fn key(&self) -> (PeerUid, u64) {
        (self.uid, self.tick.time())
    }

    fn is_visible(&self) -> bool {
        !self.versions.is_empty()
    }
}

/// True if `x` must be ordered after `y` because of an explicit causal link.
pub fn replaces(x: &OrderedBlock, y: &OrderedBlock) -> bool {
    if y.deps.contains(x.tick) {
        return false;
    }
    x.deps.contains(y.tick)
        || (x.tick.peer_index() == y.tick.peer_index() && x.tick.time() > y.tick.time())
        || x.happened_before.dominates(y.tick)
}

/// Position of `a` relative to `b` in the ordered list.
pub fn compare(a: &OrderedBlock, b: &OrderedBlock) -> Ordering {
    if replaces(a, b) {
        Ordering::Greater
    } else if replaces(b, a) {
        Ordering::Less
    } else {
        a.key().cmp(&b.key())
    }
}

/// Outcome of [`BlockList::insert`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Insertion {
    /// Where the block landed among the visible blocks, or `None` if later
    /// blocks masked all of it.
    pub position: Option<usize>,
    /// Blocks that no longer contribute anything, possibly including the
    /// inserted one.
    pub removed: Vec<Tick>,
    /// The inserted block's versions that are now visible.
    pub effective: VersionSet,
}

/// Applied blocks in order. Fully masked blocks stay as placeholders and
/// are skipped by every accessor.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    entries: Vec<OrderedBlock>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible blocks.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderedBlock> + '_ {
        self.entries.iter().filter(|b| b.is_visible())
    }

    pub fn ticks(&self) -> Vec<Tick> {
        self.iter().map(|b| b.tick).collect()
    }

    /// Ticks of the visible blocks that write any object in `versions`.
    pub fn overlapping(&self, versions: &VersionSet) -> TickSet {
        self.iter()
            .filter(|b| b.versions.overlaps(versions))
            .map(|b| b.tick)
            .collect()
    }

    /// Current value of `object`: the last ordered block writing it.
    pub fn value(&self, object: ObjectId) -> Option<&Bytes> {
        self.entries.iter().rev().find_map(|b| b.versions.get(object))
    }

    pub fn values(&self) -> BTreeMap<ObjectId, Bytes> {
        let mut values = BTreeMap::new();
        for block in self.iter() {
            for (object, value) in block.versions.iter() {
                values.insert(object, value.clone());
            }
        }
        values
    }

    /// Where `block` goes: after everything it replaces, then before the
    /// first block with a larger key.
    fn position_of(&self, block: &OrderedBlock) -> usize {
        let ready = self
            .entries
            .iter()
            .rposition(|existing| replaces(block, existing))
            .map_or(0, |i| i + 1);
        self.entries[ready..]
            .iter()
            .position(|existing| existing.key() > block.key())
            .map_or(self.entries.len(), |i| ready + i)
    }

    /// Insert `block` in order and apply masking both ways.
    pub fn insert(&mut self, mut block: OrderedBlock) -> Insertion {
        let position = self.position_of(&block);
        debug_assert!(self.entries[position..]
            .iter()
            .all(|later| !replaces(&block, later)));

        for later in &self.entries[position..] {
            block.versions.mask(&later.versions);
        }

        let mut removed = Vec::new();
        for earlier in &mut self.entries[..position] {
            if earlier.is_visible()
                && earlier.versions.mask(&block.versions) > 0
                && !earlier.is_visible()
            {
                removed.push(earlier.tick);
            }
        }

        let effective = block.versions.clone();
        let visible_position = if block.is_visible() {
            Some(self.entries[..position].iter().filter(|b| b.is_visible()).count())
        } else {
            removed.push(block.tick);
            None
        };
        self.entries.insert(position, block);
        Insertion {
            position: visible_position,
            removed,
            effective,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Peer;

    fn peer(seed: &str) -> Peer {
        Peer::get_or_create(PeerUid::derive(seed)).unwrap()
    }

    fn versions(pairs: &[(ObjectId, &'static str)]) -> VersionSet {
        pairs
            .iter()
            .map(|(o, v)| (*o, Bytes::from_static(v.as_bytes())))
            .collect()
    }

    fn block(
        seed: &str,
        time: u64,
        generation: u64,
        deps: &[Tick],
        writes: &[(ObjectId, &'static str)],
    ) -> OrderedBlock {
        let tick = Tick::new(peer(seed), time).unwrap();
        OrderedBlock::new(
            tick,
            BlockBody {
                deps: deps.iter().copied().collect(),
                happened_before: MaxTickMap::new(),
                generation,
                versions: versions(writes),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_superset_write_removes_earlier_block() {
        let mut list = BlockList::new();
        let a = block("order-a", 1, 1, &[], &[(1, "a1")]);
        let a_tick = a.tick;
        list.insert(a);

        let b = block("order-a", 2, 2, &[a_tick], &[(1, "b1"), (2, "b2")]);
        let inserted = list.insert(b);

        assert_eq!(inserted.removed, vec![a_tick]);
        assert_eq!(inserted.position, Some(0));
        assert_eq!(list.len(), 1);
        assert_eq!(list.value(1).unwrap(), &Bytes::from_static(b"b1"));
    }

    /// Two concurrent blocks from fresh peers, smaller key first.
    fn concurrent_pair(
        a: &str,
        b: &str,
        first: &[(ObjectId, &'static str)],
        second: &[(ObjectId, &'static str)],
    ) -> (OrderedBlock, OrderedBlock) {
        let (lo, hi) = if peer(a).uid() < peer(b).uid() {
            (a, b)
        } else {
            (b, a)
        };
        (block(lo, 1, 1, &[], first), block(hi, 1, 1, &[], second))
    }

    #[test]
    fn test_late_arrival_is_masked_by_later_blocks() {
        let (older, newer) = concurrent_pair(
            "order-late",
            "order-late-other",
            &[(1, "old"), (3, "old")],
            &[(1, "new"), (2, "new")],
        );
        let older_tick = older.tick;
        let mut list = BlockList::new();
        list.insert(newer);
        let inserted = list.insert(older);

        assert_eq!(inserted.position, Some(0));
        assert_eq!(inserted.effective, versions(&[(3, "old")]));
        assert_eq!(list.value(1).unwrap(), &Bytes::from_static(b"new"));
        assert_eq!(list.value(3).unwrap(), &Bytes::from_static(b"old"));
        assert_eq!(list.ticks()[0], older_tick);
    }

    #[test]
    fn test_fully_masked_arrival_is_not_kept() {
        let (stale, kept) =
            concurrent_pair("order-full", "order-full-other", &[(1, "stale")], &[(1, "kept")]);
        let stale_tick = stale.tick;
        let mut list = BlockList::new();
        list.insert(kept);
        let inserted = list.insert(stale);
        assert_eq!(inserted.position, None);
        assert_eq!(inserted.removed, vec![stale_tick]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.value(1).unwrap(), &Bytes::from_static(b"kept"));
    }

    #[test]
    fn test_concurrent_blocks_ordered_by_uid() {
        let x = block("order-x", 3, 1, &[], &[(1, "x")]);
        let y = block("order-y", 3, 1, &[], &[(2, "y")]);
        let expected = if x.uid < y.uid {
            vec![x.tick, y.tick]
        } else {
            vec![y.tick, x.tick]
        };

        let mut forward = BlockList::new();
        forward.insert(x.clone());
        forward.insert(y.clone());
        let mut backward = BlockList::new();
        backward.insert(y);
        backward.insert(x);

        assert_eq!(forward.ticks(), expected);
        assert_eq!(backward.ticks(), expected);
    }

    #[test]
    fn test_generation_does_not_decide_concurrent_order() {
        let x = block("order-gen-x", 3, 7, &[], &[(1, "x")]);
        let y = block("order-gen-y", 3, 1, &[], &[(1, "y")]);
        let (first, last) = if x.uid < y.uid { (&x, &y) } else { (&y, &x) };

        let mut list = BlockList::new();
        list.insert(x.clone());
        list.insert(y.clone());

        assert_eq!(list.ticks(), vec![last.tick]);
        assert_eq!(list.value(1), last.versions.get(1));
        assert_eq!(compare(first, last), Ordering::Less);
    }

    #[test]
    fn test_masked_block_keeps_its_place() {
        // Three writers, `n` < `e` < `d` by uid. `n` follows `d` causally,
        // so it must stay behind `e` even after `d` is masked away.
        let mut seeds = ["order-place-1", "order-place-2", "order-place-3"];
        seeds.sort_by_key(|s| peer(s).uid());
        let [n_seed, e_seed, d_seed] = seeds;

        let d = block(d_seed, 1, 1, &[], &[(1, "d")]);
        let e = block(e_seed, 1, 1, &[], &[(2, "e")]);
        let mut m = block(d_seed, 2, 2, &[d.tick], &[(1, "m")]);
        m.happened_before.put_max(d.tick);
        let mut n = block(n_seed, 1, 2, &[d.tick], &[(3, "n")]);
        n.happened_before.put_max(d.tick);

        let mut masked_first = BlockList::new();
        for b in [d.clone(), e.clone(), m.clone(), n.clone()] {
            masked_first.insert(b);
        }
        let mut masked_last = BlockList::new();
        for b in [e.clone(), d.clone(), n.clone(), m.clone()] {
            masked_last.insert(b);
        }

        let expected = vec![e.tick, n.tick, m.tick];
        assert_eq!(masked_first.ticks(), expected);
        assert_eq!(masked_last.ticks(), expected);
        assert_eq!(masked_first.values(), masked_last.values());
    }

    #[test]
    fn test_dependency_overrides_generation() {
        let base = block("order-dep", 1, 5, &[], &[(1, "base")]);
        // Claims a lower generation but names `base` as a dependency.
        let child = block("order-dep-child", 2, 1, &[base.tick], &[(2, "child")]);
        assert!(replaces(&child, &base));
        assert!(!replaces(&base, &child));
        assert_eq!(compare(&child, &base), Ordering::Greater);
    }

    #[test]
    fn test_never_replaces_a_dependent() {
        let a = block("order-cycle", 1, 1, &[], &[(1, "a")]);
        let mut b = block("order-cycle-b", 1, 1, &[a.tick], &[(1, "b")]);
        b.happened_before.put_max(a.tick);
        let mut a = a;
        a.happened_before.put_max(b.tick);
        assert!(!replaces(&a, &b));
        assert!(replaces(&b, &a));
    }

    #[test]
    fn test_overlapping() {
        let mut list = BlockList::new();
        let a = block("order-overlap", 1, 1, &[], &[(1, "a")]);
        let b = block("order-overlap", 2, 2, &[], &[(2, "b")]);
        let a_tick = a.tick;
        list.insert(a);
        list.insert(b);
        let deps = list.overlapping(&versions(&[(1, "z")]));
        assert_eq!(deps.to_sorted_vec(), vec![a_tick]);
    }
}
