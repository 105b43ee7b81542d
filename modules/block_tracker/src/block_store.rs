//! Keyed, multicast store of live block records.
//!
//! Each tracked hash owns one driver task that fetches header, body, events
//! and status independently and folds them into a single `watch` channel.
//! Any number of subscribers share that one fetch group. The driver stops,
//! and the channel closes, when the hash is retired, when the retention limit
//! elapses, or when the store itself goes away.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use agora_common::{BlockHash, BlockRecord, BlockRef, ChainClient};
use futures::{future, StreamExt};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info_span, Instrument};

use crate::chain_snapshots::ChainSnapshots;

/// Membership change of the live set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Added(BlockHash),
    Removed(HashSet<BlockHash>),
}

struct Entry {
    id: u64,
    record: Arc<watch::Sender<BlockRecord>>,
    // Dropping this stops the driver
    _retire: oneshot::Sender<()>,
}

struct StoreShared {
    entries: Mutex<HashMap<BlockHash, Entry>>,
    next_id: AtomicU64,
    changes: broadcast::Sender<StoreChange>,
    client: Arc<dyn ChainClient>,
    snapshots: ChainSnapshots,
    max_retention: Duration,
}

impl StoreShared {
    fn entries(&self) -> MutexGuard<'_, HashMap<BlockHash, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove an entry if it is still the generation that asked
    fn expire(&self, hash: &BlockHash, id: u64) {
        let mut entries = self.entries();
        if entries.get(hash).is_some_and(|e| e.id == id) {
            entries.remove(hash);
            let _ = self.changes.send(StoreChange::Removed(HashSet::from([*hash])));
        }
    }
}

/// Live block records keyed by hash. Cloning shares the store.
#[derive(Clone)]
pub struct BlockStore {
    shared: Arc<StoreShared>,
}

impl BlockStore {
    pub fn new(
        client: Arc<dyn ChainClient>,
        snapshots: ChainSnapshots,
        max_retention: Duration,
        change_buffer: usize,
    ) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        Self {
            shared: Arc::new(StoreShared {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                changes,
                client,
                snapshots,
                max_retention,
            }),
        }
    }

    /// Start tracking a block. Returns false if it is already live.
    pub fn track(&self, block: BlockRef) -> bool {
        let shared = &self.shared;
        let mut entries = shared.entries();
        if entries.contains_key(&block.hash) {
            return false;
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (record, _) = watch::channel(BlockRecord::new(block));
        let record = Arc::new(record);
        let (retire_tx, retire_rx) = oneshot::channel();
        entries.insert(
            block.hash,
            Entry {
                id,
                record: record.clone(),
                _retire: retire_tx,
            },
        );

        let driver = RecordDriver {
            id,
            block,
            record,
            client: shared.client.clone(),
            snapshots: shared.snapshots.clone(),
            store: Arc::downgrade(shared),
            max_retention: shared.max_retention,
        };
        let span = info_span!("block", number = block.number, hash = %block.hash);
        tokio::spawn(driver.run(retire_rx).instrument(span));

        // Sent under the lock so add/remove notifications keep their order
        let _ = shared.changes.send(StoreChange::Added(block.hash));
        debug!("Tracking block {} at {}", block.hash, block.number);
        true
    }

    /// Stop tracking the given hashes; returns how many were live
    pub fn retire(&self, hashes: impl IntoIterator<Item = BlockHash>) -> usize {
        let mut entries = self.shared.entries();
        let removed: HashSet<BlockHash> =
            hashes.into_iter().filter(|hash| entries.remove(hash).is_some()).collect();
        let count = removed.len();
        if count > 0 {
            debug!("Retired {count} blocks");
            let _ = self.shared.changes.send(StoreChange::Removed(removed));
        }
        count
    }

    pub fn retire_all(&self) -> usize {
        let hashes = self.live_hashes();
        self.retire(hashes)
    }

    pub fn subscribe(&self, hash: &BlockHash) -> Option<watch::Receiver<BlockRecord>> {
        self.shared.entries().get(hash).map(|e| e.record.subscribe())
    }

    /// Latest value of a live record
    pub fn current(&self, hash: &BlockHash) -> Option<BlockRecord> {
        self.shared.entries().get(hash).map(|e| e.record.borrow().clone())
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.shared.entries().contains_key(hash)
    }

    pub fn live_hashes(&self) -> Vec<BlockHash> {
        self.shared.entries().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries().is_empty()
    }

    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.shared.changes.subscribe()
    }
}

enum DriverExit {
    Retired,
    Expired,
}

/// Populates one record until it is retired or expires
struct RecordDriver {
    id: u64,
    block: BlockRef,
    record: Arc<watch::Sender<BlockRecord>>,
    client: Arc<dyn ChainClient>,
    snapshots: ChainSnapshots,
    store: Weak<StoreShared>,
    max_retention: Duration,
}

impl RecordDriver {
    async fn run(self, retire: oneshot::Receiver<()>) {
        let channels = async {
            tokio::join!(
                self.load_header(),
                self.load_body(),
                self.load_events(),
                self.load_status()
            );
            debug!("All channels settled");
            // Keep the record live until retired
            future::pending::<()>().await;
        };

        let exit = tokio::select! {
            _ = channels => DriverExit::Retired,
            _ = retire => DriverExit::Retired,
            _ = tokio::time::sleep(self.max_retention) => DriverExit::Expired,
        };

        match exit {
            DriverExit::Retired => debug!("Record retired"),
            DriverExit::Expired => {
                debug!("Record reached its retention limit");
                if let Some(store) = self.store.upgrade() {
                    store.expire(&self.block.hash, self.id);
                }
            }
        }
    }

    async fn load_header(&self) {
        match self.client.fetch_header(self.block.hash).await {
            Ok(header) => self.record.send_modify(|r| r.header = Some(header)),
            Err(e) => error!("fetch header failed: {e}"),
        }
    }

    async fn load_body(&self) {
        let mut body = self.client.watch_body(self.block.hash);
        while let Some(item) = body.next().await {
            match item {
                Ok(extrinsics) => self.record.send_modify(|r| r.body = Some(extrinsics)),
                Err(e) => {
                    error!("fetch body failed: {e}");
                    return;
                }
            }
        }
    }

    async fn load_events(&self) {
        match self.client.fetch_events(self.block.hash).await {
            Ok(events) => self.record.send_modify(|r| r.events = Some(events)),
            Err(e) => error!("fetch events failed: {e}"),
        }
    }

    async fn load_status(&self) {
        self.snapshots
            .follow_status(self.block, |status| {
                self.record.send_if_modified(|r| {
                    if r.status == status || r.status.is_terminal() {
                        return false;
                    }
                    r.status = status;
                    true
                });
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::BlockStatus;
    use agora_test_utils::{block_ref, hash, FetchKind, MockBlock, MockChainClient};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn store_for(client: &Arc<MockChainClient>, snapshots: &ChainSnapshots) -> BlockStore {
        BlockStore::new(client.clone(), snapshots.clone(), Duration::from_secs(3600), 64)
    }

    #[tokio::test]
    async fn tracking_is_idempotent() {
        let client = MockChainClient::new();
        let block = block_ref(1, 0, 1);
        client.add_block(MockBlock::new(block));
        let store = store_for(&client, &ChainSnapshots::new());

        assert!(store.track(block));
        assert!(!store.track(block));
        assert!(!store.track(block));

        let mut rx = store.subscribe(&block.hash).unwrap();
        timeout(WAIT, rx.wait_for(|r| r.header.is_some() && r.events.is_some() && r.body.is_some()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(client.fetch_count(&block.hash, FetchKind::Header), 1);
        assert_eq!(client.fetch_count(&block.hash, FetchKind::Body), 1);
        assert_eq!(client.fetch_count(&block.hash, FetchKind::Events), 1);
    }

    #[tokio::test]
    async fn subscribers_share_one_record() {
        let client = MockChainClient::new();
        let block = block_ref(2, 1, 2);
        client.add_block(MockBlock::new(block));
        let store = store_for(&client, &ChainSnapshots::new());
        store.track(block);

        let mut first = store.subscribe(&block.hash).unwrap();
        let mut second = store.subscribe(&block.hash).unwrap();
        timeout(WAIT, first.wait_for(|r| r.header.is_some())).await.unwrap().unwrap();
        timeout(WAIT, second.wait_for(|r| r.header.is_some())).await.unwrap().unwrap();
        assert_eq!(client.fetch_count(&block.hash, FetchKind::Header), 1);
    }

    #[tokio::test]
    async fn failed_channel_stays_absent() {
        let client = MockChainClient::new();
        let block = block_ref(3, 2, 3);
        client.add_block(MockBlock::new(block));
        client.fail(block.hash, FetchKind::Events);
        let store = store_for(&client, &ChainSnapshots::new());
        store.track(block);

        let mut rx = store.subscribe(&block.hash).unwrap();
        let record = timeout(WAIT, rx.wait_for(|r| r.header.is_some() && r.body.is_some()))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert!(record.events.is_none());
        assert_eq!(record.event_count(), 0);
        assert!(store.contains(&block.hash));
    }

    #[tokio::test]
    async fn status_follows_snapshots() {
        let client = MockChainClient::new();
        let parent = block_ref(10, 9, 10);
        let block = block_ref(11, 10, 11);
        client.add_block(MockBlock::new(block));
        let snapshots = ChainSnapshots::new();
        let store = store_for(&client, &snapshots);
        store.track(block);
        let mut rx = store.subscribe(&block.hash).unwrap();

        snapshots.publish_best(vec![block, parent]);
        timeout(WAIT, rx.wait_for(|r| r.status == BlockStatus::Best)).await.unwrap().unwrap();

        snapshots.publish_finalized(block);
        snapshots.publish_best(vec![block]);
        timeout(WAIT, rx.wait_for(|r| r.status == BlockStatus::Finalized))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn retire_closes_record_and_notifies() {
        let client = MockChainClient::new();
        let block = block_ref(4, 3, 4);
        client.add_block(MockBlock::new(block));
        client.hold(block.hash);
        let store = store_for(&client, &ChainSnapshots::new());
        let mut changes = store.changes();

        store.track(block);
        let mut rx = store.subscribe(&block.hash).unwrap();
        assert_eq!(store.retire([block.hash, hash(99)]), 1);

        assert_eq!(changes.recv().await.unwrap(), StoreChange::Added(block.hash));
        assert_eq!(
            changes.recv().await.unwrap(),
            StoreChange::Removed(HashSet::from([block.hash]))
        );

        // Fetches released after retirement never reach the record
        client.release(block.hash);
        assert!(timeout(WAIT, rx.changed()).await.unwrap().is_err());
        assert!(rx.borrow().header.is_none());
        assert!(!store.contains(&block.hash));
        assert!(store.subscribe(&block.hash).is_none());
    }

    #[tokio::test]
    async fn retired_hash_can_be_tracked_again() {
        let client = MockChainClient::new();
        let block = block_ref(5, 4, 5);
        client.add_block(MockBlock::new(block));
        let store = store_for(&client, &ChainSnapshots::new());

        store.track(block);
        store.retire([block.hash]);
        assert!(store.track(block));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_after_retention() {
        let client = MockChainClient::new();
        let block = block_ref(6, 5, 6);
        client.add_block(MockBlock::new(block));
        let store = store_for(&client, &ChainSnapshots::new());
        let mut changes = store.changes();
        store.track(block);

        assert_eq!(changes.recv().await.unwrap(), StoreChange::Added(block.hash));
        let started = tokio::time::Instant::now();
        assert_eq!(
            changes.recv().await.unwrap(),
            StoreChange::Removed(HashSet::from([block.hash]))
        );
        assert!(started.elapsed() >= Duration::from_secs(3599));
        assert!(store.is_empty());
    }
}
