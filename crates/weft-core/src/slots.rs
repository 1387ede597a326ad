//! Open-addressed table of raw tick values shared by [`TickSet`] and
//! [`MaxTickMap`].
//!
//! Slots hold `u64` entries. `0` marks a never-used slot and `u64::MAX` a
//! tombstone, so both markers coincide with [`Tick::NONE`] and
//! [`Tick::REMOVED`]. Entries are looked up by a key derived from the entry
//! itself: the whole tick for sets, the peer index for max maps.
//!
//! [`TickSet`]: crate::TickSet
//! [`MaxTickMap`]: crate::MaxTickMap
//! [`Tick::NONE`]: crate::Tick::NONE
//! [`Tick::REMOVED`]: crate::Tick::REMOVED

pub(crate) const EMPTY: u64 = 0;
pub(crate) const TOMBSTONE: u64 = u64::MAX;

const MIN_CAPACITY: usize = 8;

pub(crate) type KeyFn = fn(u64) -> u64;

pub(crate) enum Slot {
    Found(usize),
    Vacant(usize),
}

#[derive(Clone, Default)]
pub(crate) struct Slots {
    slots: Box<[u64]>,
    len: usize,
    /// Live entries plus tombstones.
    used: usize,
}

fn spread(key: u64) -> u64 {
    let h = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^ (h >> 29)
}

impl Slots {
    pub fn with_capacity(n: usize) -> Self {
        if n == 0 {
            return Self::default();
        }
        let cap = (n * 4 / 3 + 1).next_power_of_two().max(MIN_CAPACITY);
        Self {
            slots: vec![EMPTY; cap].into_boxed_slice(),
            len: 0,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn find(&self, key: u64, key_of: KeyFn) -> Slot {
        if self.slots.is_empty() {
            return Slot::Vacant(0);
        }
        let mask = self.slots.len() - 1;
        let mut i = spread(key) as usize & mask;
        let mut first_tombstone = None;
        loop {
            match self.slots[i] {
                EMPTY => return Slot::Vacant(first_tombstone.unwrap_or(i)),
                TOMBSTONE => {
                    first_tombstone.get_or_insert(i);
                }
                entry if key_of(entry) == key => return Slot::Found(i),
                _ => {}
            }
            i = (i + 1) & mask;
        }
    }

    pub fn get(&self, index: usize) -> u64 {
        self.slots[index]
    }

    pub fn set(&mut self, index: usize, entry: u64) {
        debug_assert!(entry != EMPTY && entry != TOMBSTONE);
        debug_assert!(self.slots[index] != EMPTY && self.slots[index] != TOMBSTONE);
        self.slots[index] = entry;
    }

    /// Insert an entry whose key is known to be absent.
    pub fn insert(&mut self, entry: u64, key_of: KeyFn) {
        debug_assert!(entry != EMPTY && entry != TOMBSTONE);
        self.reserve_one(key_of);
        match self.find(key_of(entry), key_of) {
            Slot::Vacant(i) => {
                if self.slots[i] == EMPTY {
                    self.used += 1;
                }
                self.slots[i] = entry;
                self.len += 1;
            }
            Slot::Found(i) => {
                debug_assert!(false, "duplicate key inserted into slot table");
                self.slots[i] = entry;
            }
        }
    }

    pub fn remove_at(&mut self, index: usize) -> u64 {
        let entry = self.slots[index];
        debug_assert!(entry != EMPTY && entry != TOMBSTONE);
        self.slots[index] = TOMBSTONE;
        self.len -= 1;
        entry
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = EMPTY);
        self.len = 0;
        self.used = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots
            .iter()
            .copied()
            .filter(|&s| s != EMPTY && s != TOMBSTONE)
    }

    /// Keep the load factor (tombstones included) under 3/4, doubling and
    /// rehashing when needed. Rehashing drops every tombstone.
    fn reserve_one(&mut self, key_of: KeyFn) {
        let cap = self.slots.len();
        if cap != 0 && (self.used + 1) * 4 <= cap * 3 {
            return;
        }
        let new_cap = if cap == 0 {
            MIN_CAPACITY
        } else if (self.len + 1) * 2 <= cap {
            // Mostly tombstones: rehash in place at the same size.
            cap
        } else {
            cap * 2
        };
        let old = std::mem::replace(&mut self.slots, vec![EMPTY; new_cap].into_boxed_slice());
        self.len = 0;
        self.used = 0;
        let mask = new_cap - 1;
        for entry in old.iter().copied().filter(|&s| s != EMPTY && s != TOMBSTONE) {
            let mut i = spread(key_of(entry)) as usize & mask;
            while self.slots[i] != EMPTY {
                i = (i + 1) & mask;
            }
            self.slots[i] = entry;
            self.len += 1;
            self.used += 1;
        }
    }
}
