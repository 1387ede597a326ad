//! Order-sensitive digests of resource state.
//!
//! Two locations that applied the same blocks hold the same ordered list,
//! regardless of arrival order. Comparing digests is cheaper than comparing
//! lists, and the digest uses peer uids so it is comparable across
//! processes whose peer indices differ.

use std::collections::BTreeMap;

use bytes::Bytes;
use weft_core::ObjectId;

use crate::order::OrderedBlock;

/// Digest of an ordered block list.
pub fn state_hash<'a>(blocks: impl IntoIterator<Item = &'a OrderedBlock>) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for block in blocks {
        hasher.update(block.uid.as_bytes());
        hasher.update(&block.tick.time().to_le_bytes());
        hasher.update(&block.generation.to_le_bytes());
        hasher.update(&(block.versions.len() as u64).to_le_bytes());
        for (object, value) in block.versions.iter() {
            hasher.update(&object.to_le_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
    }
    hasher.finalize()
}

/// Digest of materialized object values.
pub fn values_hash(values: &BTreeMap<ObjectId, Bytes>) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for (object, value) in values {
        hasher.update(&object.to_le_bytes());
        hasher.update(&(value.len() as u64).to_le_bytes());
        hasher.update(value);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_hash_depends_on_content() {
        let mut a = BTreeMap::new();
        a.insert(1, Bytes::from_static(b"x"));
        let mut b = a.clone();
        assert_eq!(values_hash(&a), values_hash(&b));
        b.insert(1, Bytes::from_static(b"y"));
        assert_ne!(values_hash(&a), values_hash(&b));
    }

    #[test]
    fn test_length_prefix_separates_values() {
        let mut a = BTreeMap::new();
        a.insert(1, Bytes::from_static(b"ab"));
        a.insert(2, Bytes::from_static(b""));
        let mut b = BTreeMap::new();
        b.insert(1, Bytes::from_static(b"a"));
        b.insert(2, Bytes::from_static(b"b"));
        assert_ne!(values_hash(&a), values_hash(&b));
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(state_hash(std::iter::empty()), blake3::Hasher::new().finalize());
    }
}
