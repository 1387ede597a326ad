//! Per-connection queue of outbound blocks.
//!
//! Blocks are sent in arrival order while the queue is short. Once it grows
//! past a threshold the order degrades to whatever the hash buckets yield,
//! which keeps enqueue and cancel O(1) under load. The queue also folds
//! redundant work: a block that removes an older queued block of the same
//! resource replaces it, unless the older one was requested, and enqueueing
//! a tick twice merges the two.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use weft_core::{Block, Tick};

use crate::uri::UriId;

type Key = (UriId, Tick);

/// A block waiting to be written, with the resource it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBlock {
    pub uri: UriId,
    pub resource: Arc<str>,
    pub block: Block,
}

#[derive(Debug)]
pub struct BlockQueue {
    threshold: usize,
    entries: HashMap<Key, QueuedBlock>,
    /// Arrival order. Only maintained while `ordered` is true.
    order: VecDeque<Key>,
    ordered: bool,
}

impl BlockQueue {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            entries: HashMap::new(),
            order: VecDeque::new(),
            ordered: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uri: UriId, tick: Tick) -> bool {
        self.entries.contains_key(&(uri, tick))
    }

    /// Queue a block for sending.
    pub fn enqueue(&mut self, uri: UriId, resource: Arc<str>, mut block: Block) {
        if let Some(removals) = block.removals.clone() {
            for removed in removals.iter() {
                // A requested block answers a GET_BLOCK and must still go out.
                if self
                    .entries
                    .get(&(uri, removed))
                    .map_or(false, |queued| queued.block.requested)
                {
                    continue;
                }
                if let Some(older) = self.cancel(uri, removed) {
                    tracing::trace!(%removed, superseded_by = %block.tick, "folded queued block");
                    if let Some(inherited) = older.block.removals {
                        let mut merged = block.removals.take().unwrap_or_default();
                        merged.union_with(&inherited);
                        block.removals = Some(merged);
                    }
                }
            }
        }

        let key = (uri, block.tick);
        if let Some(existing) = self.entries.get_mut(&key) {
            existing.block.requested |= block.requested;
            if let Some(extra) = block.removals {
                let mut merged = existing.block.removals.take().unwrap_or_default();
                merged.union_with(&extra);
                existing.block.removals = Some(merged);
            }
            return;
        }

        self.entries.insert(
            key,
            QueuedBlock {
                uri,
                resource,
                block,
            },
        );
        if self.ordered {
            if self.entries.len() > self.threshold {
                self.ordered = false;
                self.order.clear();
            } else {
                self.order.push_back(key);
            }
        }
    }

    /// Drop a queued block. Returns it if it was still queued.
    pub fn cancel(&mut self, uri: UriId, tick: Tick) -> Option<QueuedBlock> {
        let key = (uri, tick);
        let removed = self.entries.remove(&key)?;
        if self.ordered {
            if let Some(pos) = self.order.iter().position(|k| *k == key) {
                self.order.remove(pos);
            }
        }
        self.reset_if_drained();
        Some(removed)
    }

    /// Take the next block to send.
    pub fn next_block(&mut self) -> Option<QueuedBlock> {
        let key = if self.ordered {
            self.order.pop_front()?
        } else {
            *self.entries.keys().next()?
        };
        let next = self.entries.remove(&key);
        self.reset_if_drained();
        next
    }

    fn reset_if_drained(&mut self) {
        if self.entries.is_empty() {
            self.ordered = true;
            self.order.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use weft_core::{Peer, PeerUid, TickSet};

    fn tick(time: u64) -> Tick {
        Tick::new(Peer::get_or_create(PeerUid::derive("queue")).unwrap(), time).unwrap()
    }

    fn block(time: u64) -> Block {
        Block::new(tick(time), Bytes::from_static(b"b"))
    }

    fn name() -> Arc<str> {
        Arc::from("doc")
    }

    #[test]
    fn test_fifo_below_threshold() {
        let uri = UriId::next();
        let mut queue = BlockQueue::new(16);
        for t in [5, 3, 9, 1] {
            queue.enqueue(uri, name(), block(t));
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.next_block())
            .map(|q| q.block.tick.time())
            .collect();
        assert_eq!(order, vec![5, 3, 9, 1]);
    }

    #[test]
    fn test_cancel_keeps_remaining_order() {
        let uri = UriId::next();
        let mut queue = BlockQueue::new(16);
        for t in 1..=4 {
            queue.enqueue(uri, name(), block(t));
        }
        assert!(queue.cancel(uri, tick(2)).is_some());
        assert!(queue.cancel(uri, tick(2)).is_none());
        let order: Vec<u64> = std::iter::from_fn(|| queue.next_block())
            .map(|q| q.block.tick.time())
            .collect();
        assert_eq!(order, vec![1, 3, 4]);
    }

    #[test]
    fn test_over_threshold_still_delivers_everything() {
        let uri = UriId::next();
        let mut queue = BlockQueue::new(2);
        for t in 1..=10 {
            queue.enqueue(uri, name(), block(t));
        }
        assert_eq!(queue.len(), 10);
        let mut seen: Vec<u64> = std::iter::from_fn(|| queue.next_block())
            .map(|q| q.block.tick.time())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());

        // Drained: back to FIFO.
        queue.enqueue(uri, name(), block(20));
        queue.enqueue(uri, name(), block(11));
        assert_eq!(queue.next_block().unwrap().block.tick, tick(20));
    }

    #[test]
    fn test_removal_folds_older_block() {
        let uri = UriId::next();
        let mut queue = BlockQueue::new(16);
        let older_removals: TickSet = [tick(1)].into_iter().collect();
        queue.enqueue(uri, name(), block(2).with_removals(older_removals));
        queue.enqueue(uri, name(), block(3));

        let removals: TickSet = [tick(2)].into_iter().collect();
        queue.enqueue(uri, name(), block(4).with_removals(removals));

        assert!(!queue.contains(uri, tick(2)));
        assert_eq!(queue.next_block().unwrap().block.tick, tick(3));
        let folded = queue.next_block().unwrap().block;
        assert_eq!(folded.tick, tick(4));
        let removals = folded.removals.unwrap();
        assert!(removals.contains(tick(1)) && removals.contains(tick(2)));
    }

    #[test]
    fn test_removal_keeps_requested_block() {
        let uri = UriId::next();
        let mut queue = BlockQueue::new(16);
        queue.enqueue(uri, name(), block(1).with_requested(true));

        let removals: TickSet = [tick(1)].into_iter().collect();
        queue.enqueue(uri, name(), block(2).with_removals(removals));

        assert!(queue.contains(uri, tick(1)));
        let first = queue.next_block().unwrap().block;
        assert_eq!(first.tick, tick(1));
        assert!(first.requested);
        let second = queue.next_block().unwrap().block;
        assert_eq!(second.tick, tick(2));
        assert!(second.removals.unwrap().contains(tick(1)));
    }

    #[test]
    fn test_removal_does_not_cross_resources() {
        let (a, b) = (UriId::next(), UriId::next());
        let mut queue = BlockQueue::new(16);
        queue.enqueue(a, name(), block(1));
        let removals: TickSet = [tick(1)].into_iter().collect();
        queue.enqueue(b, name(), block(2).with_removals(removals));
        assert!(queue.contains(a, tick(1)));
    }

    #[test]
    fn test_duplicate_merges_requested() {
        let uri = UriId::next();
        let mut queue = BlockQueue::new(16);
        queue.enqueue(uri, name(), block(1));
        queue.enqueue(uri, name(), block(1).with_requested(true));
        assert_eq!(queue.len(), 1);
        assert!(queue.next_block().unwrap().block.requested);
        assert!(queue.is_empty());
    }
}
