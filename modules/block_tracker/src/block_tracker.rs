//! Agora block tracker
//! Reconciles a chain client's head notifications into live block records,
//! a recent-events ticker and a by-height block index

pub mod block_store;
pub mod chain_head;
pub mod chain_snapshots;
pub mod classifier;
pub mod configuration;
pub mod event_filter;
pub mod event_projector;
pub mod finalized_index;
pub mod height_index;
mod live_records;
pub mod tracker_error;
pub mod unpinned_resolver;

use std::sync::Arc;

use agora_common::{BlockHash, BlockRecord, ChainClient};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

pub use block_store::{BlockStore, StoreChange};
pub use chain_snapshots::ChainSnapshots;
pub use configuration::TrackerConfig;
pub use event_projector::{EventRow, RecentEvents};
pub use height_index::{HeightIndex, HeightIndexSnapshot};
pub use tracker_error::{ResolveError, TrackerError};
pub use unpinned_resolver::{BlockKey, UnpinnedResolver};

use chain_head::run_chain_head;
use event_projector::run_event_projector;
use height_index::run_height_index;

/// Latest view of one block; `None` while it is still being fetched
pub type BlockInfo = watch::Receiver<Option<BlockRecord>>;

/// One tracking session over one chain client.
///
/// Dropping the tracker ends the session: live records are retired and all
/// background tasks are aborted. To follow a replacement client, drop this
/// tracker and spawn a new one.
pub struct BlockTracker {
    store: BlockStore,
    snapshots: ChainSnapshots,
    resolver: UnpinnedResolver,
    injector: mpsc::UnboundedSender<BlockRecord>,
    events: watch::Receiver<RecentEvents>,
    heights: watch::Receiver<HeightIndex>,
    tasks: JoinSet<Result<(), TrackerError>>,
    // Dropped to stop the session tasks
    stop: Option<watch::Sender<()>>,
    stop_rx: watch::Receiver<()>,
}

impl BlockTracker {
    /// Subscribe to the client and start every background task
    pub fn spawn(client: Arc<dyn ChainClient>, config: TrackerConfig) -> Self {
        let snapshots = ChainSnapshots::new();
        let store = BlockStore::new(
            client.clone(),
            snapshots.clone(),
            config.max_retention(),
            config.change_buffer,
        );
        let resolver = UnpinnedResolver::new(client.clone(), snapshots.clone(), config.resolver.clone());

        let (stop, stop_rx) = watch::channel(());
        let (injector, injected) = mpsc::unbounded_channel();
        let (events_tx, events) = watch::channel(RecentEvents::default());
        let (heights_tx, heights) = watch::channel(HeightIndex::new());

        let mut tasks = JoinSet::new();
        tasks.spawn(
            run_event_projector(store.clone(), config.events.clone(), events_tx, stop_rx.clone())
                .map(Ok)
                .instrument(info_span!("event_projector")),
        );
        tasks.spawn(
            run_height_index(store.clone(), injected, heights_tx, stop_rx.clone())
                .map(Ok)
                .instrument(info_span!("height_index")),
        );
        tasks.spawn(
            snapshots
                .clone()
                .run_best(client.best_blocks())
                .instrument(info_span!("best_blocks")),
        );
        tasks.spawn(
            snapshots
                .clone()
                .run_finalized(client.finalized_blocks())
                .instrument(info_span!("finalized_blocks")),
        );
        tasks.spawn(
            run_chain_head(
                client.announcements(),
                store.clone(),
                snapshots.clone(),
                resolver.clone(),
                injector.clone(),
                stop_rx.clone(),
            )
            .instrument(info_span!("chain_head")),
        );

        info!("Block tracker started");
        Self {
            store,
            snapshots,
            resolver,
            injector,
            events,
            heights,
            tasks,
            stop: Some(stop),
            stop_rx,
        }
    }

    /// Everything a block detail view needs, by hash or height.
    ///
    /// Live blocks are served from the store, blocks already in the height
    /// index without a fetch, and anything else through the unpinned
    /// resolver. The receiver closes when the block stops being followed.
    pub async fn block_info_by_key(&self, key: &str) -> Result<BlockInfo, ResolveError> {
        let key = BlockKey::parse(key)?;

        if let BlockKey::Hash(hash) = key {
            if let Some(info) = self.live_info(&hash) {
                return Ok(info);
            }
        }

        let known = {
            let index = self.heights.borrow();
            match key {
                BlockKey::Hash(hash) => index.find_hash(&hash),
                BlockKey::Height(height) => index.find_at_height(height),
            }
        };
        if let Some(record) = known {
            let hash = record.hash;
            return Ok(self
                .live_info(&hash)
                .unwrap_or_else(|| self.follow_detached(hash, Some(record))));
        }

        let hash = self.resolver.block_hash(key).await?;
        if let Some(info) = self.live_info(&hash) {
            return Ok(info);
        }
        let known = self.heights.borrow().find_hash(&hash);
        Ok(self.follow_detached(hash, known))
    }

    /// Forward a live record until it is retired or the caller goes away
    fn live_info(&self, hash: &BlockHash) -> Option<BlockInfo> {
        let mut source = self.store.subscribe(hash)?;
        let (tx, rx) = watch::channel(Some(source.borrow_and_update().clone()));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = source.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let record = source.borrow_and_update().clone();
                        tx.send_replace(Some(record));
                    }
                    _ = tx.closed() => break,
                }
            }
        });
        Some(rx)
    }

    /// Resolve a block outside the live store (unless `seed` already has it)
    /// and keep its status current. Every version is injected into the
    /// height index.
    fn follow_detached(&self, hash: BlockHash, seed: Option<BlockRecord>) -> BlockInfo {
        let (tx, rx) = watch::channel(None);
        let resolver = self.resolver.clone();
        let snapshots = self.snapshots.clone();
        let injector = self.injector.clone();
        let mut stop = self.stop_rx.clone();

        let follow = async move {
            let work = async {
                let record = match seed {
                    Some(record) => record,
                    None => match resolver.resolve(hash).await {
                        Ok(record) => {
                            let _ = injector.send(record.clone());
                            record
                        }
                        Err(e) => {
                            warn!("Could not resolve block: {e}");
                            return;
                        }
                    },
                };
                let block = record.block_ref();
                tx.send_replace(Some(record));

                snapshots
                    .follow_status(block, |status| {
                        let changed = tx.send_if_modified(|current| match current {
                            Some(record) if record.status != status && !record.status.is_terminal() => {
                                record.status = status;
                                true
                            }
                            _ => false,
                        });
                        if changed {
                            if let Some(record) = tx.borrow().clone() {
                                let _ = injector.send(record);
                            }
                        }
                    })
                    .await;
            };

            tokio::select! {
                _ = work => debug!("Detached block settled"),
                _ = tx.closed() => debug!("Detached block abandoned"),
                _ = stop.changed() => {}
            }
        };
        tokio::spawn(follow.instrument(info_span!("detached", hash = %hash)));
        rx
    }

    /// Newest-first ticker of interesting events
    pub fn recent_filtered_events(&self) -> watch::Receiver<RecentEvents> {
        self.events.clone()
    }

    pub fn height_index(&self) -> watch::Receiver<HeightIndex> {
        self.heights.clone()
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn snapshots(&self) -> &ChainSnapshots {
        &self.snapshots
    }

    pub fn resolver(&self) -> &UnpinnedResolver {
        &self.resolver
    }

    /// Resolves when the first session task ends. An error means the client
    /// failed and live tracking is over for this session.
    pub async fn wait(&mut self) -> Result<(), TrackerError> {
        match self.tasks.join_next().await {
            Some(result) => result?,
            None => Ok(()),
        }
    }

    pub async fn shutdown(mut self) {
        self.stop.take();
        let retired = self.store.retire_all();
        self.tasks.shutdown().await;
        info!("Block tracker stopped, {retired} records retired");
    }
}

impl Drop for BlockTracker {
    fn drop(&mut self) {
        self.store.retire_all();
    }
}
