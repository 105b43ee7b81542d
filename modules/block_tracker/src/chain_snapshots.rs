//! Latest best-chain and finalized snapshots, shared by every classifier run.

use std::sync::Arc;

use agora_common::{BlockRef, BlockStatus, ClientStream};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::classifier;
use crate::finalized_index::FinalizedIndex;
use crate::tracker_error::TrackerError;

/// Best chain, tip first, finalized tip last.
pub type BestChain = Arc<Vec<BlockRef>>;

/// Holds the best-chain and finalized snapshots plus the finalized-height
/// index they accumulate into. Cloning shares state.
#[derive(Clone)]
pub struct ChainSnapshots {
    best: Arc<watch::Sender<BestChain>>,
    finalized: Arc<watch::Sender<Option<BlockRef>>>,
    index: FinalizedIndex,
}

impl Default for ChainSnapshots {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainSnapshots {
    pub fn new() -> Self {
        let (best, _) = watch::channel(Arc::new(Vec::new()));
        let (finalized, _) = watch::channel(None);
        Self {
            best: Arc::new(best),
            finalized: Arc::new(finalized),
            index: FinalizedIndex::new(),
        }
    }

    pub fn index(&self) -> &FinalizedIndex {
        &self.index
    }

    pub fn best_chain(&self) -> BestChain {
        self.best.borrow().clone()
    }

    pub fn latest_finalized(&self) -> Option<BlockRef> {
        *self.finalized.borrow()
    }

    pub fn subscribe_best(&self) -> watch::Receiver<BestChain> {
        self.best.subscribe()
    }

    pub fn subscribe_finalized(&self) -> watch::Receiver<Option<BlockRef>> {
        self.finalized.subscribe()
    }

    pub fn publish_best(&self, chain: Vec<BlockRef>) {
        self.best.send_replace(Arc::new(chain));
    }

    /// Accumulate into the index first so that anyone woken by the
    /// notification already sees the new entry
    pub fn publish_finalized(&self, block: BlockRef) {
        self.index.insert(block.hash, block.number);
        self.finalized.send_replace(Some(block));
    }

    /// One classification against the current snapshots
    pub fn classify(&self, block: &BlockRef) -> Option<BlockStatus> {
        let chain = self.best_chain();
        classifier::evaluate(&chain, &self.index, block)
    }

    /// Wait until a best chain is known, then classify
    pub async fn classify_when_ready(&self, block: &BlockRef) -> BlockStatus {
        let mut best = self.best.subscribe();
        // The sender lives in self, so this only fails if self is gone
        let _ = best.wait_for(|chain| !chain.is_empty()).await;
        self.classify(block).unwrap_or_default()
    }

    /// Wait for the finalized snapshot to reach `number`
    pub async fn finalized_at(&self, number: u64) -> Option<BlockRef> {
        let mut finalized = self.finalized.subscribe();
        let reached = finalized
            .wait_for(|latest| latest.is_some_and(|b| b.number >= number))
            .await
            .ok()?;
        *reached
    }

    /// Re-classify `block` on every best or finalized emission, reporting
    /// each change, until it latches into a terminal status
    pub async fn follow_status(&self, block: BlockRef, mut on_change: impl FnMut(BlockStatus)) {
        let mut best = self.best.subscribe();
        let mut finalized = self.finalized.subscribe();
        let mut last = None;

        loop {
            let chain = best.borrow_and_update().clone();
            drop(finalized.borrow_and_update());

            if let Some(status) = classifier::evaluate(&chain, &self.index, &block) {
                if last != Some(status) {
                    on_change(status);
                    last = Some(status);
                }
                if status.is_terminal() {
                    debug!("Block {} settled as {status}", block.number);
                    return;
                }
            }

            tokio::select! {
                changed = best.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = finalized.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub async fn run_best(self, mut stream: ClientStream<Vec<BlockRef>>) -> Result<(), TrackerError> {
        while let Some(item) = stream.next().await {
            let chain = item.map_err(|source| TrackerError::ClientStream {
                stream: "best blocks",
                source,
            })?;
            self.publish_best(chain);
        }
        info!("Best blocks stream ended");
        Ok(())
    }

    pub async fn run_finalized(self, mut stream: ClientStream<BlockRef>) -> Result<(), TrackerError> {
        while let Some(item) = stream.next().await {
            let block = item.map_err(|source| TrackerError::ClientStream {
                stream: "finalized blocks",
                source,
            })?;
            debug!("Finalized {} at {}", block.hash, block.number);
            self.publish_finalized(block);
        }
        info!("Finalized blocks stream ended");
        Ok(())
    }
}
