//! Session-wide record of every hash known to be finalized.

use std::sync::Arc;

use agora_common::BlockHash;
use dashmap::DashMap;

/// Append-only map from finalized block hash to height.
///
/// Entries are never removed for the life of the session: a block may be
/// evicted from the live store long before anyone asks whether it was
/// finalized. Cloning shares the same map.
#[derive(Clone, Debug, Default)]
pub struct FinalizedIndex {
    heights: Arc<DashMap<BlockHash, u64>>,
}

impl FinalizedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized block. Returns false if the hash was already known.
    pub fn insert(&self, hash: BlockHash, number: u64) -> bool {
        let mut inserted = false;
        self.heights.entry(hash).or_insert_with(|| {
            inserted = true;
            number
        });
        inserted
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.heights.contains_key(hash)
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u64> {
        self.heights.get(hash).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_first_writer_wins() {
        let index = FinalizedIndex::new();
        let hash = BlockHash::new([1; 32]);
        assert!(index.insert(hash, 10));
        assert!(!index.insert(hash, 11));
        assert_eq!(index.height_of(&hash), Some(10));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn clones_share_entries() {
        let index = FinalizedIndex::new();
        let other = index.clone();
        index.insert(BlockHash::new([2; 32]), 5);
        assert!(other.contains(&BlockHash::new([2; 32])));
        assert!(!other.is_empty());
    }
}
