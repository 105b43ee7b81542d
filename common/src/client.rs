//! Capability interface onto the external chain client.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{
    error::ChainClientError, BlockAnnouncement, BlockHash, BlockHeader, BlockRef, EventRecord,
    Extrinsic,
};

pub type ClientResult<T> = Result<T, ChainClientError>;

/// Stream of client notifications; an `Err` item is fatal for the stream.
pub type ClientStream<T> = BoxStream<'static, ClientResult<T>>;

/// The chain client the tracker sits on top of.
///
/// Stream methods are called once per tracker session. Per-hash fetches may be
/// called concurrently from many tasks.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Emits each time finalization advances.
    fn finalized_blocks(&self) -> ClientStream<BlockRef>;

    /// Emits the best chain, tip first, ending with the finalized tip.
    fn best_blocks(&self) -> ClientStream<Vec<BlockRef>>;

    /// Raw chain-head announcements in arrival order.
    fn announcements(&self) -> ClientStream<BlockAnnouncement>;

    async fn fetch_header(&self, hash: BlockHash) -> ClientResult<BlockHeader>;

    /// Body of the block; may emit more than once.
    fn watch_body(&self, hash: BlockHash) -> ClientStream<Vec<Extrinsic>>;

    async fn fetch_events(&self, hash: BlockHash) -> ClientResult<Vec<EventRecord>>;

    /// Low level JSON-RPC call.
    async fn raw_request(&self, method: &str, params: Value) -> ClientResult<Value>;

    /// `System.BlockHash` storage lookup.
    async fn block_hash_at(&self, height: u64) -> ClientResult<Option<BlockHash>>;
}
