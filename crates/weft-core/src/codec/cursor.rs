//! Byte cursors the codec reads from and writes into.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::peer::Peer;

/// Accumulates inbound bytes and hands them to decoders.
///
/// Also holds the peer back-reference table for this byte stream: every
/// literal peer UID decoded from the stream gets the next slot.
#[derive(Debug, Default)]
pub struct ReadCursor {
    buf: BytesMut,
    peers: Vec<Peer>,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn can_read(&self, n: usize) -> bool {
        self.buf.len() >= n
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    pub fn try_u8(&mut self) -> Option<u8> {
        self.can_read(1).then(|| self.buf.get_u8())
    }

    pub fn try_u16(&mut self) -> Option<u16> {
        self.can_read(2).then(|| self.buf.get_u16())
    }

    pub fn try_u32(&mut self) -> Option<u32> {
        self.can_read(4).then(|| self.buf.get_u32())
    }

    pub fn try_u64(&mut self) -> Option<u64> {
        self.can_read(8).then(|| self.buf.get_u64())
    }

    /// Take exactly `n` bytes, or nothing.
    pub fn try_bytes(&mut self, n: usize) -> Option<Bytes> {
        self.can_read(n).then(|| self.buf.split_to(n).freeze())
    }

    /// Take whatever is available, up to `n` bytes. May be empty.
    pub fn take_up_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    pub(crate) fn register_peer(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub(crate) fn peer_at(&self, slot: u32) -> Option<Peer> {
        self.peers.get(slot as usize).copied()
    }
}

/// Bounded output buffer that encoders fill.
///
/// `limit` caps how many bytes may be pending before the owner drains them
/// with [`WriteCursor::take`]. Encoders suspend when a step does not fit.
#[derive(Debug)]
pub struct WriteCursor {
    buf: BytesMut,
    limit: usize,
    peers: HashMap<u32, u32>,
}

impl WriteCursor {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(64 * 1024)),
            limit,
            peers: HashMap::new(),
        }
    }

    /// A cursor that never suspends. Used for whole-value encodes.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn room(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    pub fn can_write(&self, n: usize) -> bool {
        self.room() >= n
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Drain everything written so far.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub(crate) fn peer_slot(&self, peer_index: u32) -> Option<u32> {
        self.peers.get(&peer_index).copied()
    }

    pub(crate) fn assign_peer_slot(&mut self, peer_index: u32) {
        let slot = self.peers.len() as u32;
        self.peers.insert(peer_index, slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_int_is_not_consumed() {
        let mut cur = ReadCursor::new();
        cur.feed(&[0x00, 0x01, 0x02]);
        assert_eq!(cur.try_u32(), None);
        assert_eq!(cur.remaining(), 3);
        cur.feed(&[0x03]);
        assert_eq!(cur.try_u32(), Some(0x0001_0203));
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_take_up_to() {
        let mut cur = ReadCursor::new();
        cur.feed(b"hello");
        assert_eq!(&cur.take_up_to(3)[..], b"hel");
        assert_eq!(&cur.take_up_to(10)[..], b"lo");
        assert!(cur.take_up_to(10).is_empty());
    }

    #[test]
    fn test_write_limit() {
        let mut cur = WriteCursor::new(4);
        assert!(cur.can_write(4));
        cur.put_u16(7);
        assert!(!cur.can_write(4));
        assert_eq!(cur.room(), 2);
        assert_eq!(&cur.take()[..], &[0, 7]);
        assert!(cur.can_write(4));
    }
}
