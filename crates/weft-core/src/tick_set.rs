//! Sparse set of exact ticks.

use std::fmt;

use crate::slots::{Slot, Slots};
use crate::tick::Tick;

fn whole(entry: u64) -> u64 {
    entry
}

/// Open-addressed set answering "is this exact tick known".
#[derive(Clone, Default)]
pub struct TickSet {
    slots: Slots,
}

impl TickSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            slots: Slots::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    pub fn contains(&self, tick: Tick) -> bool {
        tick.is_valid() && matches!(self.slots.find(tick.raw(), whole), Slot::Found(_))
    }

    /// Insert a tick. Returns false if it was already present or is a
    /// sentinel.
    pub fn insert(&mut self, tick: Tick) -> bool {
        if !tick.is_valid() || self.contains(tick) {
            return false;
        }
        self.slots.insert(tick.raw(), whole);
        true
    }

    pub fn remove(&mut self, tick: Tick) -> bool {
        if !tick.is_valid() {
            return false;
        }
        match self.slots.find(tick.raw(), whole) {
            Slot::Found(i) => {
                self.slots.remove_at(i);
                true
            }
            Slot::Vacant(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Iterate in table order.
    pub fn iter(&self) -> impl Iterator<Item = Tick> + '_ {
        self.slots.iter().map(Tick::from_raw)
    }

    /// Ticks in ascending raw order. Stable across processes only when peer
    /// indices agree, so use it for local determinism.
    pub fn to_sorted_vec(&self) -> Vec<Tick> {
        let mut ticks: Vec<Tick> = self.iter().collect();
        ticks.sort_unstable();
        ticks
    }

    pub fn is_subset(&self, other: &TickSet) -> bool {
        self.len() <= other.len() && self.iter().all(|t| other.contains(t))
    }

    pub fn union_with(&mut self, other: &TickSet) {
        for tick in other.iter() {
            self.insert(tick);
        }
    }
}

impl PartialEq for TickSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|t| other.contains(t))
    }
}

impl Eq for TickSet {}

impl fmt::Debug for TickSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.to_sorted_vec()).finish()
    }
}

impl FromIterator<Tick> for TickSet {
    fn from_iter<I: IntoIterator<Item = Tick>>(iter: I) -> Self {
        let mut set = TickSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<Tick> for TickSet {
    fn extend<I: IntoIterator<Item = Tick>>(&mut self, iter: I) {
        for tick in iter {
            self.insert(tick);
        }
    }
}
