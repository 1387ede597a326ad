//! Tick and tick-set encoding.
//!
//! A tick is a peer blob followed by its 8-byte time. The blob is one of:
//!
//! - `0x00`: null peer. Alone, it terminates a tick set.
//! - `0x10` + 16 UID bytes: literal peer. Assigns the next back-reference
//!   slot on both sides of the stream.
//! - `0xFF` + u32 slot: back-reference to a peer already sent.

use crate::codec::{Progress, ReadCursor, WriteCursor};
use crate::error::CodecError;
use crate::peer::{Peer, PeerUid};
use crate::tick::Tick;
use crate::tick_set::TickSet;
use crate::{need, ready};

const PEER_NULL: u8 = 0x00;
const PEER_LITERAL: u8 = PeerUid::LEN as u8;
const PEER_BACKREF: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickEncoder {
    tick: Option<Tick>,
    peer_written: bool,
}

impl TickEncoder {
    pub fn new(tick: Tick) -> Self {
        Self {
            tick: Some(tick),
            peer_written: false,
        }
    }

    /// Encodes the lone null blob that terminates a tick set.
    pub fn null() -> Self {
        Self {
            tick: None,
            peer_written: false,
        }
    }

    pub fn encode(&mut self, cur: &mut WriteCursor) -> Result<Progress<()>, CodecError> {
        let Some(tick) = self.tick else {
            if !cur.can_write(1) {
                return Ok(Progress::Suspended);
            }
            cur.put_u8(PEER_NULL);
            return Ok(Progress::Done(()));
        };

        if !self.peer_written {
            let index = tick.peer_index();
            if let Some(slot) = cur.peer_slot(index) {
                if !cur.can_write(5) {
                    return Ok(Progress::Suspended);
                }
                cur.put_u8(PEER_BACKREF);
                cur.put_u32(slot);
            } else {
                let peer = tick.peer().ok_or(CodecError::UnknownPeer(index))?;
                if !cur.can_write(1 + PeerUid::LEN) {
                    return Ok(Progress::Suspended);
                }
                cur.put_u8(PEER_LITERAL);
                cur.put_slice(peer.uid().as_bytes());
                cur.assign_peer_slot(index);
            }
            self.peer_written = true;
        }

        if !cur.can_write(8) {
            return Ok(Progress::Suspended);
        }
        cur.put_u64(tick.time());
        Ok(Progress::Done(()))
    }
}

/// Decodes one tick; `Done(None)` is the null terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickDecoder {
    peer: Option<Peer>,
}

impl TickDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, cur: &mut ReadCursor) -> Result<Progress<Option<Tick>>, CodecError> {
        if self.peer.is_none() {
            match need!(cur.peek_u8()) {
                PEER_NULL => {
                    cur.try_u8();
                    return Ok(Progress::Done(None));
                }
                PEER_LITERAL => {
                    let blob = need!(cur.try_bytes(1 + PeerUid::LEN));
                    let mut uid = [0u8; PeerUid::LEN];
                    uid.copy_from_slice(&blob[1..]);
                    let peer = Peer::get_or_create(PeerUid::from_bytes(uid))
                        .map_err(|_| CodecError::PeerSpaceExhausted)?;
                    cur.register_peer(peer);
                    self.peer = Some(peer);
                }
                PEER_BACKREF => {
                    if !cur.can_read(5) {
                        return Ok(Progress::Suspended);
                    }
                    cur.try_u8();
                    let slot = need!(cur.try_u32());
                    let peer = cur
                        .peer_at(slot)
                        .ok_or(CodecError::UnknownBackReference(slot))?;
                    self.peer = Some(peer);
                }
                other => return Err(CodecError::InvalidTag(other)),
            }
        }

        let time = need!(cur.try_u64());
        if time > Tick::MAX_TIME {
            return Err(CodecError::TimeOutOfRange(time));
        }
        let peer = self.peer.take().ok_or(CodecError::UnexpectedNull)?;
        Ok(Progress::Done(Some(Tick::from_parts(peer.index(), time))))
    }

    /// Decode a tick that must not be null.
    pub fn decode_required(&mut self, cur: &mut ReadCursor) -> Result<Progress<Tick>, CodecError> {
        match ready!(self.decode(cur)) {
            Some(tick) => Ok(Progress::Done(tick)),
            None => Err(CodecError::UnexpectedNull),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSetEncoder {
    ticks: Vec<Tick>,
    pos: usize,
    current: Option<TickEncoder>,
}

impl TickSetEncoder {
    pub fn new(set: &TickSet) -> Self {
        Self::from_ticks(set.to_sorted_vec())
    }

    pub fn from_ticks(ticks: Vec<Tick>) -> Self {
        Self {
            ticks,
            pos: 0,
            current: None,
        }
    }

    pub fn encode(&mut self, cur: &mut WriteCursor) -> Result<Progress<()>, CodecError> {
        loop {
            if self.pos > self.ticks.len() {
                return Ok(Progress::Done(()));
            }
            let encoder = self.current.get_or_insert_with(|| match self.ticks.get(self.pos) {
                Some(&tick) => TickEncoder::new(tick),
                None => TickEncoder::null(),
            });
            ready!(encoder.encode(cur));
            self.current = None;
            self.pos += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSetDecoder {
    set: TickSet,
    current: TickDecoder,
}

impl TickSetDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, cur: &mut ReadCursor) -> Result<Progress<TickSet>, CodecError> {
        loop {
            match ready!(self.current.decode(cur)) {
                Some(tick) => {
                    self.set.insert(tick);
                }
                None => return Ok(Progress::Done(std::mem::take(&mut self.set))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(seed: &str) -> Peer {
        Peer::get_or_create(PeerUid::derive(seed)).unwrap()
    }

    fn encode_set(set: &TickSet, cur: &mut WriteCursor) -> Vec<u8> {
        let mut enc = TickSetEncoder::new(set);
        assert!(enc.encode(cur).unwrap().is_done());
        cur.take().to_vec()
    }

    #[test]
    fn test_single_tick_wire_layout() {
        let p = peer("wire");
        let tick = Tick::new(p, 0x0102).unwrap();
        let mut cur = WriteCursor::unbounded();
        TickEncoder::new(tick).encode(&mut cur).unwrap();
        TickEncoder::new(tick).encode(&mut cur).unwrap();
        let bytes = cur.take();

        assert_eq!(bytes[0], PEER_LITERAL);
        assert_eq!(&bytes[1..17], p.uid().as_bytes());
        assert_eq!(&bytes[17..25], &0x0102u64.to_be_bytes());
        // Second occurrence is a back-reference to slot 0.
        assert_eq!(&bytes[25..30], &[PEER_BACKREF, 0, 0, 0, 0]);
        assert_eq!(bytes.len(), 38);
    }

    #[test]
    fn test_backreference_survives_across_values() {
        let a = peer("backref-a");
        let b = peer("backref-b");
        let first: TickSet = [Tick::new(a, 1).unwrap(), Tick::new(b, 2).unwrap()]
            .into_iter()
            .collect();
        let second: TickSet = [Tick::new(b, 3).unwrap(), Tick::new(a, 4).unwrap()]
            .into_iter()
            .collect();

        let mut wcur = WriteCursor::unbounded();
        let mut bytes = encode_set(&first, &mut wcur);
        let second_bytes = encode_set(&second, &mut wcur);
        // Both peers are back-references the second time around.
        assert_eq!(second_bytes.len(), 2 * (5 + 8) + 1);
        bytes.extend_from_slice(&second_bytes);

        let mut rcur = ReadCursor::new();
        rcur.feed(&bytes);
        let mut dec = TickSetDecoder::new();
        assert_eq!(dec.decode(&mut rcur).unwrap(), Progress::Done(first));
        assert_eq!(dec.decode(&mut rcur).unwrap(), Progress::Done(second));
    }

    #[test]
    fn test_unknown_backreference() {
        let mut cur = ReadCursor::new();
        cur.feed(&[PEER_BACKREF, 0, 0, 0, 9]);
        let mut dec = TickDecoder::new();
        assert_eq!(dec.decode(&mut cur), Err(CodecError::UnknownBackReference(9)));
    }

    #[test]
    fn test_decode_required_rejects_null() {
        let mut cur = ReadCursor::new();
        cur.feed(&[PEER_NULL]);
        let mut dec = TickDecoder::new();
        assert_eq!(dec.decode_required(&mut cur), Err(CodecError::UnexpectedNull));
    }

    #[test]
    fn test_resume_without_bytes_keeps_state() {
        let p = peer("resume");
        let set: TickSet = (1..5).map(|t| Tick::new(p, t).unwrap()).collect();
        let bytes = encode_set(&set, &mut WriteCursor::unbounded());

        let mut cur = ReadCursor::new();
        cur.feed(&bytes[..20]);
        let mut dec = TickSetDecoder::new();
        assert_eq!(dec.decode(&mut cur).unwrap(), Progress::Suspended);
        let snapshot = dec.clone();
        let left = cur.remaining();
        assert_eq!(dec.decode(&mut cur).unwrap(), Progress::Suspended);
        assert_eq!(dec, snapshot);
        assert_eq!(cur.remaining(), left);
    }

    #[test]
    fn test_encoder_resumes_across_small_buffers() {
        let p = peer("small-buffers");
        let set: TickSet = (1..20).map(|t| Tick::new(p, t * 7).unwrap()).collect();
        let mut cur = WriteCursor::new(17);
        let mut enc = TickSetEncoder::new(&set);
        let mut bytes = Vec::new();
        loop {
            let done = enc.encode(&mut cur).unwrap().is_done();
            bytes.extend_from_slice(&cur.take());
            if done {
                break;
            }
        }
        let mut rcur = ReadCursor::new();
        rcur.feed(&bytes);
        let decoded = TickSetDecoder::new().decode(&mut rcur).unwrap();
        assert_eq!(decoded, Progress::Done(set));
    }

    proptest! {
        #[test]
        fn tick_set_roundtrip_any_split(
            times in prop::collection::vec((0usize..4, 1u64..1_000_000), 0..40),
            split in 0usize..2000,
        ) {
            let peers = [peer("split-a"), peer("split-b"), peer("split-c"), peer("split-d")];
            let set: TickSet = times
                .iter()
                .map(|&(p, t)| Tick::new(peers[p], t).unwrap())
                .collect();
            let bytes = encode_set(&set, &mut WriteCursor::unbounded());
            let split = split.min(bytes.len());

            let mut cur = ReadCursor::new();
            let mut dec = TickSetDecoder::new();
            cur.feed(&bytes[..split]);
            let decoded = match dec.decode(&mut cur).unwrap() {
                Progress::Done(set) => set,
                Progress::Suspended => {
                    cur.feed(&bytes[split..]);
                    dec.decode(&mut cur).unwrap().done().unwrap()
                }
            };
            prop_assert_eq!(decoded, set);
        }
    }
}
