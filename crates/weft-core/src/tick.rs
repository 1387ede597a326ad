//! Ticks: 64-bit causal stamps, and the clock that produces them.
//!
//! Layout: `peer_index (24 bits) << 40 | time (40 bits)`. Time is measured in
//! 1/125 s units (8 ms) since the Unix epoch, which fits 40 bits for the next
//! few centuries.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, Result};
use crate::max_tick::MaxTickMap;
use crate::peer::Peer;

const TIME_BITS: u32 = 40;
const TIME_MASK: u64 = (1 << TIME_BITS) - 1;

/// A causal timestamp naming one peer and one logical time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tick(u64);

impl Tick {
    /// "No tick". Also the empty slot marker in open-addressed tables.
    pub const NONE: Tick = Tick(0);

    /// Removed-slot sentinel.
    pub const REMOVED: Tick = Tick(u64::MAX);

    pub const MAX_TIME: u64 = TIME_MASK;

    /// Build a tick for `peer` at `time`.
    pub fn new(peer: Peer, time: u64) -> Result<Tick> {
        if time > TIME_MASK {
            return Err(CoreError::TimeOutOfRange(time));
        }
        Ok(Self::from_parts(peer.index(), time))
    }

    pub(crate) const fn from_parts(peer_index: u32, time: u64) -> Tick {
        Tick(((peer_index as u64) << TIME_BITS) | (time & TIME_MASK))
    }

    pub const fn from_raw(raw: u64) -> Tick {
        Tick(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn peer_index(self) -> u32 {
        (self.0 >> TIME_BITS) as u32
    }

    pub const fn time(self) -> u64 {
        self.0 & TIME_MASK
    }

    /// Resolve the owning peer through the registry.
    pub fn peer(self) -> Option<Peer> {
        Peer::from_index(self.peer_index())
    }

    /// True for ticks that name a real peer.
    pub const fn is_valid(self) -> bool {
        self.0 != Self::NONE.0 && self.0 != Self::REMOVED.0 && self.peer_index() != 0
    }

    /// Domination test: true iff `map` holds an entry for this tick's peer
    /// whose time is at or after this tick's time.
    ///
    /// This is not set membership. A map that saw `(p, 10)` reports every
    /// `(p, t <= 10)` as happened-before.
    pub fn happened_before(self, map: &MaxTickMap) -> bool {
        map.get(self.peer_index())
            .map_or(false, |max| max.time() >= self.time())
    }
}

impl fmt::Debug for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tick::NONE => write!(f, "Tick(none)"),
            Tick::REMOVED => write!(f, "Tick(removed)"),
            t => write!(f, "Tick({}@{})", t.peer_index(), t.time()),
        }
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_index(), self.time())
    }
}

/// Produces monotonically increasing ticks for one local peer.
///
/// The clock never hands out the same time twice and never goes backwards,
/// even if the wall clock does. [`Clock::observe`] folds in remote ticks so
/// that a local write always lands after everything it has seen.
#[derive(Debug)]
pub struct Clock {
    peer: Peer,
    last: AtomicU64,
    wall: bool,
}

impl Clock {
    /// A clock driven by wall time in 8 ms units.
    pub fn system(peer: Peer) -> Self {
        Self {
            peer,
            last: AtomicU64::new(0),
            wall: true,
        }
    }

    /// A purely logical clock starting after `start`. Deterministic, for tests.
    pub fn logical(peer: Peer, start: u64) -> Self {
        Self {
            peer,
            last: AtomicU64::new(start.min(Tick::MAX_TIME)),
            wall: false,
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Next tick for the local peer, strictly later than any previous one.
    ///
    /// Fails once the 40-bit time space is used up rather than wrapping
    /// back to zero.
    pub fn next(&self) -> Result<Tick> {
        let wall = if self.wall { wall_time() } else { 0 };
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let time = wall.max(last + 1);
            if time > Tick::MAX_TIME {
                return Err(CoreError::TimeOutOfRange(time));
            }
            match self
                .last
                .compare_exchange_weak(last, time, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(Tick::from_parts(self.peer.index(), time)),
                Err(current) => last = current,
            }
        }
    }

    /// Advance past a tick seen from any peer.
    pub fn observe(&self, tick: Tick) {
        if tick.is_valid() {
            self.last.fetch_max(tick.time(), Ordering::AcqRel);
        }
    }

    /// Last time handed out or observed.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

fn wall_time() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    (millis / 8).min(TIME_MASK)
}
