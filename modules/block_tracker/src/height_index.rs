//! By-height view of every block the tracker knows about.
//!
//! Live records come in through store notifications and leave with them.
//! Records produced by the unpinned resolver come in through a separate
//! injection channel and stay until overwritten.

use agora_common::{BlockHash, BlockRecord};
use imbl::OrdMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::block_store::BlockStore;
use crate::live_records::{LiveEvent, LiveRecords};

/// Height -> hash -> record
pub type HeightIndexSnapshot = OrdMap<u64, imbl::HashMap<BlockHash, BlockRecord>>;

/// Built on persistent maps, so every published copy is cheap to clone
#[derive(Debug, Clone, Default)]
pub struct HeightIndex {
    blocks: HeightIndexSnapshot,
    // Heights of entries that came from the live store
    live_heights: imbl::HashMap<BlockHash, u64>,
}

impl HeightIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, record: BlockRecord) {
        self.blocks.entry(record.number).or_default().insert(record.hash, record);
    }

    /// Insert or refresh a record from the live store
    pub fn insert_live(&mut self, record: BlockRecord) {
        self.live_heights.insert(record.hash, record.number);
        self.insert(record);
    }

    /// Insert a resolver-produced record; store removals never touch it
    pub fn insert_detached(&mut self, record: BlockRecord) {
        self.live_heights.remove(&record.hash);
        self.insert(record);
    }

    /// Drop live entries, deleting buckets that become empty
    pub fn remove<'a>(&mut self, hashes: impl IntoIterator<Item = &'a BlockHash>) -> usize {
        let mut removed = 0;
        for hash in hashes {
            let Some(height) = self.live_heights.remove(hash) else {
                continue;
            };
            if let Some(bucket) = self.blocks.get_mut(&height) {
                if bucket.remove(hash).is_some() {
                    removed += 1;
                }
                if bucket.is_empty() {
                    self.blocks.remove(&height);
                }
            }
        }
        removed
    }

    pub fn is_live(&self, hash: &BlockHash) -> bool {
        self.live_heights.contains_key(hash)
    }

    pub fn at_height(&self, height: u64) -> Vec<BlockRecord> {
        self.blocks
            .get(&height)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A record at `height`, preferring one from the live store
    pub fn find_at_height(&self, height: u64) -> Option<BlockRecord> {
        let bucket = self.blocks.get(&height)?;
        bucket
            .values()
            .find(|record| self.is_live(&record.hash))
            .or_else(|| bucket.values().next())
            .cloned()
    }

    pub fn find_hash(&self, hash: &BlockHash) -> Option<BlockRecord> {
        let height = self.live_heights.get(hash);
        match height {
            Some(height) => self.blocks.get(height)?.get(hash).cloned(),
            None => self.blocks.values().find_map(|bucket| bucket.get(hash).cloned()),
        }
    }

    pub fn heights(&self) -> usize {
        self.blocks.len()
    }

    pub fn snapshot(&self) -> HeightIndexSnapshot {
        self.blocks.clone()
    }
}

/// Keep `output` equal to the height index built from the store's live
/// records plus everything sent through `injected`
pub async fn run_height_index(
    store: BlockStore,
    mut injected: mpsc::UnboundedReceiver<BlockRecord>,
    output: watch::Sender<HeightIndex>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut index = HeightIndex::new();
    let mut live = LiveRecords::new(store);

    loop {
        tokio::select! {
            event = live.next() => match event {
                LiveEvent::Record(record) => {
                    // Later emissions keep the entry fresh until it settles
                    if record.is_settled() {
                        live.unfollow(&record.hash);
                    }
                    index.insert_live(record);
                }
                LiveEvent::Removed(hashes) => {
                    let removed = index.remove(&hashes);
                    debug!("Removed {removed} blocks from the height index");
                }
                LiveEvent::Closed => break,
            },

            Some(record) = injected.recv() => {
                debug!("Injected block {} at {}", record.hash, record.number);
                index.insert_detached(record);
            }

            _ = shutdown.changed() => break,
        }

        output.send_replace(index.clone());
    }
    info!("Height index stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::BlockStatus;
    use agora_test_utils::{block_ref, hash};

    fn record(h: u64, number: u64) -> BlockRecord {
        BlockRecord::new(block_ref(h, number - 1, number))
    }

    #[test]
    fn live_entries_share_buckets_and_leave_with_them() {
        let mut index = HeightIndex::new();
        index.insert_live(record(11, 11));
        index.insert_live(record(111, 11));
        index.insert_live(record(12, 12));
        assert_eq!(index.at_height(11).len(), 2);

        assert_eq!(index.remove(&[hash(11)]), 1);
        assert_eq!(index.at_height(11).len(), 1);
        assert_eq!(index.remove(&[hash(111), hash(999)]), 1);
        assert!(index.at_height(11).is_empty());
        assert!(!index.snapshot().contains_key(&11));
        assert_eq!(index.heights(), 1);
    }

    #[test]
    fn detached_entries_survive_removals() {
        let mut index = HeightIndex::new();
        index.insert_detached(record(1, 1));
        assert_eq!(index.remove(&[hash(1)]), 0);
        assert_eq!(index.find_hash(&hash(1)).unwrap().number, 1);
        assert!(!index.is_live(&hash(1)));
    }

    #[test]
    fn refresh_overwrites_entry() {
        let mut index = HeightIndex::new();
        index.insert_live(record(5, 5));
        let mut updated = record(5, 5);
        updated.status = BlockStatus::Finalized;
        index.insert_live(updated);
        assert_eq!(index.at_height(5).len(), 1);
        assert_eq!(index.find_hash(&hash(5)).unwrap().status, BlockStatus::Finalized);
    }

    #[test]
    fn find_at_height_prefers_live() {
        let mut index = HeightIndex::new();
        index.insert_detached(record(70, 7));
        index.insert_live(record(7, 7));
        assert_eq!(index.find_at_height(7).unwrap().hash, hash(7));
        assert!(index.find_at_height(8).is_none());
    }

    #[test]
    fn snapshots_are_independent() {
        let mut index = HeightIndex::new();
        index.insert_live(record(3, 3));
        let before = index.snapshot();
        index.remove(&[hash(3)]);
        assert_eq!(before.len(), 1);
        assert!(index.snapshot().is_empty());
    }
}
