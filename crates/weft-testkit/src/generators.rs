//! Proptest strategies for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use weft_core::{ObjectId, VersionSet};

/// Object ids from a small space, so generated writes collide often.
pub fn object_id() -> impl Strategy<Value = ObjectId> {
    0u64..6
}

pub fn value() -> impl Strategy<Value = Bytes> {
    proptest::collection::vec(any::<u8>(), 0..8).prop_map(Bytes::from)
}

/// A non-empty version set.
pub fn version_set() -> impl Strategy<Value = VersionSet> {
    proptest::collection::btree_map(object_id(), value(), 1..4)
        .prop_map(|m| m.into_iter().collect())
}

/// One write in a plan: which writer performs it, whether the writer first
/// catches up with every earlier write, and what it writes.
#[derive(Debug, Clone)]
pub struct PlannedWrite {
    pub writer: usize,
    pub catch_up: bool,
    pub versions: VersionSet,
}

/// Up to `max_len` writes spread over `writers` writers.
pub fn write_plan(writers: usize, max_len: usize) -> impl Strategy<Value = Vec<PlannedWrite>> {
    proptest::collection::vec(
        (0..writers, any::<bool>(), version_set()).prop_map(|(writer, catch_up, versions)| {
            PlannedWrite {
                writer,
                catch_up,
                versions,
            }
        }),
        1..=max_len,
    )
}

/// A permutation of `0..n`.
pub fn arrival_order(n: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..n).collect::<Vec<_>>()).prop_shuffle()
}
