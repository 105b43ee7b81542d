//! Follows every live record of a [`BlockStore`] as one merged stream.
//!
//! Shared by the projectors: store change notifications open and close the
//! per-record subscriptions, and a lagged change receiver is recovered by
//! resynchronising against the store's current live set.

use std::collections::HashSet;

use agora_common::{BlockHash, BlockRecord};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, warn};

use crate::block_store::{BlockStore, StoreChange};

pub(crate) enum LiveEvent {
    /// A followed record emitted a new value
    Record(BlockRecord),
    /// These hashes left the live set
    Removed(HashSet<BlockHash>),
    /// The store is gone
    Closed,
}

pub(crate) struct LiveRecords {
    store: BlockStore,
    changes: broadcast::Receiver<StoreChange>,
    records: StreamMap<BlockHash, WatchStream<BlockRecord>>,
    // Every hash reported and not yet removed, followed or not
    known: HashSet<BlockHash>,
}

impl LiveRecords {
    pub fn new(store: BlockStore) -> Self {
        // Subscribe before reading the live set so nothing falls in between
        let changes = store.changes();
        let mut live = Self {
            store,
            changes,
            records: StreamMap::new(),
            known: HashSet::new(),
        };
        for hash in live.store.live_hashes() {
            live.follow(hash);
        }
        live
    }

    fn follow(&mut self, hash: BlockHash) {
        if let Some(record) = self.store.subscribe(&hash) {
            self.known.insert(hash);
            self.records.insert(hash, WatchStream::new(record));
        }
    }

    /// Stop receiving updates for a record that can no longer change
    pub fn unfollow(&mut self, hash: &BlockHash) {
        self.records.remove(hash);
    }

    #[cfg(test)]
    pub fn is_followed(&self, hash: &BlockHash) -> bool {
        self.records.contains_key(hash)
    }

    fn forget(&mut self, hashes: &HashSet<BlockHash>) {
        for hash in hashes {
            self.records.remove(hash);
            self.known.remove(hash);
        }
    }

    fn resync(&mut self) -> Option<HashSet<BlockHash>> {
        let live: HashSet<BlockHash> = self.store.live_hashes().into_iter().collect();
        let gone: HashSet<BlockHash> = self.known.difference(&live).copied().collect();
        self.forget(&gone);
        for hash in live {
            if !self.known.contains(&hash) {
                self.follow(hash);
            }
        }
        debug!("Resynchronised with {} live records", self.known.len());
        (!gone.is_empty()).then_some(gone)
    }

    /// Next record emission or removal. Cancel safe.
    pub async fn next(&mut self) -> LiveEvent {
        loop {
            tokio::select! {
                change = self.changes.recv() => match change {
                    Ok(StoreChange::Added(hash)) => self.follow(hash),
                    Ok(StoreChange::Removed(hashes)) => {
                        self.forget(&hashes);
                        return LiveEvent::Removed(hashes);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {missed} store changes, resynchronising");
                        if let Some(gone) = self.resync() {
                            return LiveEvent::Removed(gone);
                        }
                    }
                    Err(RecvError::Closed) => return LiveEvent::Closed,
                },

                Some((_, record)) = self.records.next() => return LiveEvent::Record(record),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_snapshots::ChainSnapshots;
    use agora_test_utils::{block_ref, MockBlock, MockChainClient};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn follows_existing_and_new_records() {
        let client = MockChainClient::new();
        let a = block_ref(1, 0, 1);
        let b = block_ref(2, 1, 2);
        client.add_block(MockBlock::new(a));
        client.add_block(MockBlock::new(b));
        let store = BlockStore::new(client, ChainSnapshots::new(), Duration::from_secs(60), 16);
        store.track(a);

        let mut live = LiveRecords::new(store.clone());
        store.track(b);

        let mut seen = HashSet::new();
        while seen.len() < 2 {
            match timeout(WAIT, live.next()).await.unwrap() {
                LiveEvent::Record(record) => {
                    seen.insert(record.hash);
                }
                _ => panic!("unexpected event"),
            }
        }
        assert!(live.is_followed(&a.hash) && live.is_followed(&b.hash));

        store.retire([a.hash]);
        loop {
            match timeout(WAIT, live.next()).await.unwrap() {
                LiveEvent::Removed(hashes) => {
                    assert_eq!(hashes, HashSet::from([a.hash]));
                    break;
                }
                LiveEvent::Record(_) => continue,
                LiveEvent::Closed => panic!("store closed"),
            }
        }
        assert!(!live.is_followed(&a.hash));
    }

    #[tokio::test]
    async fn lagging_receiver_resynchronises() {
        let client = MockChainClient::new();
        let store = BlockStore::new(client, ChainSnapshots::new(), Duration::from_secs(60), 1);
        let blocks: Vec<_> = (1..=4).map(|n| block_ref(n, n - 1, n)).collect();
        store.track(blocks[0]);

        let mut live = LiveRecords::new(store.clone());
        for block in &blocks[1..] {
            store.track(*block);
        }
        store.retire([blocks[0].hash]);

        loop {
            match timeout(WAIT, live.next()).await.unwrap() {
                LiveEvent::Removed(hashes) => {
                    assert!(hashes.contains(&blocks[0].hash));
                    break;
                }
                LiveEvent::Record(_) => continue,
                LiveEvent::Closed => panic!("store closed"),
            }
        }
        for block in &blocks[1..] {
            assert!(live.is_followed(&block.hash));
        }
    }
}
