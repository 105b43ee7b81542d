//! Chain-head subscriber: turns raw announcements into store activity.

use std::collections::HashMap;

use agora_common::{BlockAnnouncement, BlockHash, BlockRecord, BlockRef, ClientStream};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::block_store::BlockStore;
use crate::chain_snapshots::ChainSnapshots;
use crate::tracker_error::TrackerError;
use crate::unpinned_resolver::UnpinnedResolver;

struct ChainHead {
    store: BlockStore,
    snapshots: ChainSnapshots,
    resolver: UnpinnedResolver,
    injector: mpsc::UnboundedSender<BlockRecord>,
    resolving: JoinSet<BlockHash>,
    // One resolution per hash at a time
    pending: HashMap<BlockHash, AbortHandle>,
    shutdown: watch::Receiver<()>,
}

impl ChainHead {
    async fn handle(&mut self, announcement: BlockAnnouncement) {
        match announcement {
            BlockAnnouncement::NewBlock(block) => self.track(block),

            BlockAnnouncement::Initialized { finalized_number } => {
                info!("Chain head initialized at finalized height {finalized_number}");
                let reached = tokio::select! {
                    reached = self.snapshots.finalized_at(finalized_number) => reached,
                    _ = self.shutdown.changed() => return,
                };
                match reached {
                    Some(block) => {
                        if block.number != finalized_number {
                            warn!(
                                "Finalized stream moved on to {} before reaching {finalized_number}, seeding that block",
                                block.number
                            );
                        }
                        self.track(block);
                    }
                    None => warn!("Finalized stream closed before reaching {finalized_number}"),
                }
            }

            BlockAnnouncement::Finalized { hash } => {
                if !self.store.contains(&hash) {
                    self.resolve_unseen(hash);
                }
            }

            BlockAnnouncement::Unpinned { hashes } => {
                self.store.retire(hashes);
            }
        }
    }

    /// A live block needs no resolution any more
    fn track(&mut self, block: BlockRef) {
        if let Some(resolution) = self.pending.remove(&block.hash) {
            debug!("Block {} is live now, dropping its resolution", block.hash);
            resolution.abort();
        }
        self.store.track(block);
    }

    /// Finalization jumped over a block we never saw announced
    fn resolve_unseen(&mut self, hash: BlockHash) {
        if self.pending.contains_key(&hash) {
            debug!("Finalized block {hash} is already being resolved");
            return;
        }
        debug!("Finalized block {hash} is not tracked, resolving");
        let resolver = self.resolver.clone();
        let injector = self.injector.clone();
        let resolution = self.resolving.spawn(
            async move {
                match resolver.resolve_in_background(hash).await {
                    Ok(record) => {
                        let _ = injector.send(record);
                    }
                    Err(e) => warn!("Could not resolve finalized block: {e}"),
                }
                hash
            }
            .instrument(info_span!("resolve", hash = %hash)),
        );
        self.pending.insert(hash, resolution);
    }

    fn resolved(&mut self, done: Result<BlockHash, tokio::task::JoinError>) {
        match done {
            Ok(hash) => {
                self.pending.remove(&hash);
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!("Resolver task failed: {e}");
                }
                self.pending.retain(|_, resolution| !resolution.is_finished());
            }
        }
    }
}

/// Process announcements strictly in arrival order until the stream ends,
/// fails, or `shutdown` fires. Outstanding resolutions are abandoned on exit.
///
/// An `Initialized` announcement holds the queue until the finalized stream
/// reaches the announced height, so later announcements never overtake it;
/// `shutdown` still interrupts the wait.
pub async fn run_chain_head(
    mut announcements: ClientStream<BlockAnnouncement>,
    store: BlockStore,
    snapshots: ChainSnapshots,
    resolver: UnpinnedResolver,
    injector: mpsc::UnboundedSender<BlockRecord>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), TrackerError> {
    let mut head = ChainHead {
        store,
        snapshots,
        resolver,
        injector,
        resolving: JoinSet::new(),
        pending: HashMap::new(),
        shutdown: shutdown.clone(),
    };

    loop {
        tokio::select! {
            item = announcements.next() => {
                let Some(item) = item else {
                    info!("Announcement stream ended");
                    return Ok(());
                };
                let announcement = item.map_err(|source| TrackerError::ClientStream {
                    stream: "announcements",
                    source,
                })?;
                head.handle(announcement).await;
            }

            Some(done) = head.resolving.join_next(), if !head.resolving.is_empty() => {
                head.resolved(done);
            }

            _ = shutdown.changed() => {
                debug!("Chain head subscriber shutting down");
                return Ok(());
            }
        }
    }
}
