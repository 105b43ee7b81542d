//! A [`ChainClient`] that serves a recorded session.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use agora_common::rpc::{ARCHIVE_HASH_BY_HEIGHT, CHAIN_GET_BLOCK};
use agora_common::{
    BlockAnnouncement, BlockHash, BlockHeader, BlockRef, ChainClient, ChainClientError,
    ClientResult, ClientStream, EventRecord, Extrinsic,
};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::session::{RecordedBlock, Session};

type Feed<T> = Mutex<Option<mpsc::UnboundedReceiver<ClientResult<T>>>>;

/// Sending halves of the client's subscriptions, driven by playback
pub struct SessionFeeds {
    pub best: mpsc::UnboundedSender<ClientResult<Vec<BlockRef>>>,
    pub finalized: mpsc::UnboundedSender<ClientResult<BlockRef>>,
    pub announcements: mpsc::UnboundedSender<ClientResult<BlockAnnouncement>>,
}

pub struct RecordedClient {
    blocks: HashMap<BlockHash, RecordedBlock>,
    rpc_blocks: HashMap<BlockHash, Value>,
    archive_hashes: BTreeMap<u64, BlockHash>,
    storage_hashes: BTreeMap<u64, BlockHash>,
    best: Feed<Vec<BlockRef>>,
    finalized: Feed<BlockRef>,
    announcements: Feed<BlockAnnouncement>,
}

fn take<T: Send + 'static>(feed: &Feed<T>, name: &str) -> ClientStream<T> {
    match feed.lock().unwrap_or_else(PoisonError::into_inner).take() {
        Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
        None => stream::iter([Err(ChainClientError::StreamClosed(format!(
            "{name} already subscribed"
        )))])
        .boxed(),
    }
}

impl RecordedClient {
    pub fn new(session: &Session) -> (Arc<Self>, SessionFeeds) {
        let (best_tx, best_rx) = mpsc::unbounded_channel();
        let (finalized_tx, finalized_rx) = mpsc::unbounded_channel();
        let (announcements_tx, announcements_rx) = mpsc::unbounded_channel();

        let client = Self {
            blocks: session.blocks.iter().map(|b| (b.block.hash, b.clone())).collect(),
            rpc_blocks: session.rpc_blocks.clone(),
            archive_hashes: session.archive_hashes.clone(),
            storage_hashes: session.storage_hashes.clone(),
            best: Mutex::new(Some(best_rx)),
            finalized: Mutex::new(Some(finalized_rx)),
            announcements: Mutex::new(Some(announcements_rx)),
        };
        let feeds = SessionFeeds {
            best: best_tx,
            finalized: finalized_tx,
            announcements: announcements_tx,
        };
        (Arc::new(client), feeds)
    }

    fn block(&self, hash: BlockHash) -> ClientResult<&RecordedBlock> {
        self.blocks.get(&hash).ok_or(ChainClientError::NotFound { hash })
    }
}

#[async_trait]
impl ChainClient for RecordedClient {
    fn finalized_blocks(&self) -> ClientStream<BlockRef> {
        take(&self.finalized, "finalized blocks")
    }

    fn best_blocks(&self) -> ClientStream<Vec<BlockRef>> {
        take(&self.best, "best blocks")
    }

    fn announcements(&self) -> ClientStream<BlockAnnouncement> {
        take(&self.announcements, "announcements")
    }

    async fn fetch_header(&self, hash: BlockHash) -> ClientResult<BlockHeader> {
        self.block(hash)?
            .header
            .clone()
            .ok_or(ChainClientError::NotFound { hash })
    }

    fn watch_body(&self, hash: BlockHash) -> ClientStream<Vec<Extrinsic>> {
        let body = self.block(hash).map(|b| b.body.clone());
        stream::iter([body]).boxed()
    }

    async fn fetch_events(&self, hash: BlockHash) -> ClientResult<Vec<EventRecord>> {
        Ok(self.block(hash)?.events.clone())
    }

    async fn raw_request(&self, method: &str, params: Value) -> ClientResult<Value> {
        match method {
            ARCHIVE_HASH_BY_HEIGHT => {
                let hashes: Vec<BlockHash> = params[0]
                    .as_u64()
                    .and_then(|height| self.archive_hashes.get(&height))
                    .into_iter()
                    .copied()
                    .collect();
                Ok(json!(hashes))
            }
            CHAIN_GET_BLOCK => {
                let hash: BlockHash = serde_json::from_value(params[0].clone())?;
                Ok(self.rpc_blocks.get(&hash).cloned().unwrap_or(Value::Null))
            }
            _ => Err(ChainClientError::Unsupported {
                method: method.to_string(),
            }),
        }
    }

    async fn block_hash_at(&self, height: u64) -> ClientResult<Option<BlockHash>> {
        Ok(self.storage_hashes.get(&height).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        serde_json::from_value(json!({
            "blocks": [{
                "hash": BlockHash::new([2; 32]),
                "parent": BlockHash::new([1; 32]),
                "number": 2,
                "body": ["0x00", "0x01"]
            }],
            "archive-hashes": { "2": BlockHash::new([2; 32]) },
            "steps": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn serves_recorded_blocks() {
        let (client, _feeds) = RecordedClient::new(&session());
        let hash = BlockHash::new([2; 32]);

        let body = client.watch_body(hash).next().await.unwrap().unwrap();
        assert_eq!(body.len(), 2);
        assert!(client.fetch_events(hash).await.unwrap().is_empty());
        // No header was recorded
        assert!(matches!(
            client.fetch_header(hash).await,
            Err(ChainClientError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn answers_fallback_rpc() {
        let (client, _feeds) = RecordedClient::new(&session());
        let hashes = client.raw_request(ARCHIVE_HASH_BY_HEIGHT, json!([2])).await.unwrap();
        assert_eq!(hashes, json!([BlockHash::new([2; 32])]));
        let missing = client
            .raw_request(CHAIN_GET_BLOCK, json!([BlockHash::new([9; 32])]))
            .await
            .unwrap();
        assert!(missing.is_null());
        assert!(client.raw_request("state_getMetadata", json!([])).await.is_err());
    }

    #[tokio::test]
    async fn subscriptions_are_taken_once() {
        let (client, feeds) = RecordedClient::new(&session());
        let mut best = client.best_blocks();
        feeds.best.send(Ok(vec![])).unwrap();
        assert!(best.next().await.unwrap().unwrap().is_empty());
        assert!(client.best_blocks().next().await.unwrap().is_err());
    }
}
