//! Test helpers for Agora modules: a scripted chain client and fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agora_common::rpc::{ARCHIVE_HASH_BY_HEIGHT, CHAIN_GET_BLOCK};
use agora_common::{
    BlockAnnouncement, BlockHash, BlockHeader, BlockRef, ChainClient, ChainClientError,
    ChainEvent, ClientResult, ClientStream, EventRecord, Extrinsic, Phase,
};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Deterministic hash for a small number
pub fn hash(n: u64) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xa9;
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    BlockHash::new(bytes)
}

pub fn block_ref(h: u64, parent: u64, number: u64) -> BlockRef {
    BlockRef {
        hash: hash(h),
        parent: hash(parent),
        number,
    }
}

pub fn header_for(block: &BlockRef) -> BlockHeader {
    BlockHeader {
        parent_hash: block.parent,
        number: block.number,
        state_root: hash(1_000_000 + block.number),
        extrinsics_root: hash(2_000_000 + block.number),
        digests: vec![json!("0x0642414245")],
    }
}

pub fn event(pallet: &str, variant: &str, phase: Phase) -> EventRecord {
    EventRecord::new(phase, ChainEvent::new(pallet, variant))
}

/// A `chain_getBlock` response for `block`
pub fn rpc_block(block: &BlockRef, extrinsics: usize) -> Value {
    let header = header_for(block);
    let extrinsics: Vec<String> = (0..extrinsics).map(|i| format!("0x{i:02x}")).collect();
    json!({
        "block": {
            "extrinsics": extrinsics,
            "header": {
                "parentHash": header.parent_hash,
                "number": format!("0x{:x}", header.number),
                "stateRoot": header.state_root,
                "extrinsicsRoot": header.extrinsics_root,
                "digest": { "logs": header.digests },
            }
        }
    })
}

/// Everything the mock serves for one block
#[derive(Debug, Clone)]
pub struct MockBlock {
    pub block: BlockRef,
    pub header: BlockHeader,
    pub body: Vec<Extrinsic>,
    pub events: Vec<EventRecord>,
}

impl MockBlock {
    pub fn new(block: BlockRef) -> Self {
        Self {
            block,
            header: header_for(&block),
            body: vec!["0x0400".to_string()],
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<EventRecord>) -> Self {
        self.events = events;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    Header,
    Body,
    Events,
}

/// A client stream the test pushes into; the client side can be taken once
struct Feed<T> {
    tx: mpsc::UnboundedSender<ClientResult<T>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ClientResult<T>>>>,
}

impl<T: Send + 'static> Feed<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn push(&self, item: ClientResult<T>) {
        let _ = self.tx.send(item);
    }

    fn take(&self, name: &str) -> ClientStream<T> {
        match lock(&self.rx).take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => stream::once(futures::future::ready(Err(ChainClientError::StreamClosed(
                format!("{name} already taken"),
            ))))
            .boxed(),
        }
    }
}

#[derive(Default)]
struct MockState {
    blocks: HashMap<BlockHash, MockBlock>,
    failures: HashSet<(BlockHash, FetchKind)>,
    fetches: HashMap<(BlockHash, FetchKind), usize>,
    gates: HashMap<BlockHash, watch::Sender<bool>>,
    archive: HashMap<u64, BlockHash>,
    archive_unsupported: bool,
    storage: HashMap<u64, BlockHash>,
    // Response plus how many polls answer null first
    rpc_blocks: HashMap<BlockHash, (Value, usize)>,
    rpc_calls: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted [`ChainClient`]
pub struct MockChainClient {
    finalized: Feed<BlockRef>,
    best: Feed<Vec<BlockRef>>,
    announcements: Feed<BlockAnnouncement>,
    state: Mutex<MockState>,
}

impl MockChainClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            finalized: Feed::new(),
            best: Feed::new(),
            announcements: Feed::new(),
            state: Mutex::new(MockState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    pub fn add_block(&self, block: MockBlock) {
        self.state().blocks.insert(block.block.hash, block);
    }

    /// Make one channel of one block fail
    pub fn fail(&self, hash: BlockHash, kind: FetchKind) {
        self.state().failures.insert((hash, kind));
    }

    /// Hold every fetch for `hash` until released
    pub fn hold(&self, hash: BlockHash) {
        let (gate, _) = watch::channel(false);
        self.state().gates.insert(hash, gate);
    }

    pub fn release(&self, hash: BlockHash) {
        if let Some(gate) = self.state().gates.remove(&hash) {
            gate.send_replace(true);
        }
    }

    pub fn fetch_count(&self, hash: &BlockHash, kind: FetchKind) -> usize {
        self.state().fetches.get(&(*hash, kind)).copied().unwrap_or(0)
    }

    pub fn announce(&self, announcement: BlockAnnouncement) {
        self.announcements.push(Ok(announcement));
    }

    pub fn fail_announcements(&self, error: ChainClientError) {
        self.announcements.push(Err(error));
    }

    /// Best chain, tip first, finalized tip last
    pub fn set_best(&self, chain: Vec<BlockRef>) {
        self.best.push(Ok(chain));
    }

    pub fn finalize(&self, block: BlockRef) {
        self.finalized.push(Ok(block));
    }

    pub fn set_archive_hash(&self, height: u64, hash: BlockHash) {
        self.state().archive.insert(height, hash);
    }

    pub fn set_archive_unsupported(&self) {
        self.state().archive_unsupported = true;
    }

    pub fn set_storage_hash(&self, height: u64, hash: BlockHash) {
        self.state().storage.insert(height, hash);
    }

    /// Script `chain_getBlock` for `hash`: `null_polls` null answers first
    pub fn set_rpc_block(&self, hash: BlockHash, response: Value, null_polls: usize) {
        self.state().rpc_blocks.insert(hash, (response, null_polls));
    }

    /// Methods passed to `raw_request`, in call order
    pub fn rpc_calls(&self) -> Vec<String> {
        self.state().rpc_calls.clone()
    }

    /// Count the fetch and pick its outcome now; the gate is awaited later
    fn begin<T>(
        &self,
        hash: BlockHash,
        kind: FetchKind,
        select: impl FnOnce(&MockBlock) -> T,
    ) -> (Option<watch::Receiver<bool>>, ClientResult<T>) {
        let mut state = self.state();
        *state.fetches.entry((hash, kind)).or_default() += 1;
        let gate = state.gates.get(&hash).map(watch::Sender::subscribe);
        let result = if state.failures.contains(&(hash, kind)) {
            Err(ChainClientError::Transport(format!("{kind:?} fetch failed")))
        } else {
            state
                .blocks
                .get(&hash)
                .map(select)
                .ok_or(ChainClientError::NotFound { hash })
        };
        (gate, result)
    }
}

async fn pass(gate: Option<watch::Receiver<bool>>) {
    if let Some(mut gate) = gate {
        let _ = gate.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn finalized_blocks(&self) -> ClientStream<BlockRef> {
        self.finalized.take("finalized blocks")
    }

    fn best_blocks(&self) -> ClientStream<Vec<BlockRef>> {
        self.best.take("best blocks")
    }

    fn announcements(&self) -> ClientStream<BlockAnnouncement> {
        self.announcements.take("announcements")
    }

    async fn fetch_header(&self, hash: BlockHash) -> ClientResult<BlockHeader> {
        let (gate, result) = self.begin(hash, FetchKind::Header, |b| b.header.clone());
        pass(gate).await;
        result
    }

    fn watch_body(&self, hash: BlockHash) -> ClientStream<Vec<Extrinsic>> {
        let (gate, result) = self.begin(hash, FetchKind::Body, |b| b.body.clone());
        stream::once(async move {
            pass(gate).await;
            result
        })
        .boxed()
    }

    async fn fetch_events(&self, hash: BlockHash) -> ClientResult<Vec<EventRecord>> {
        let (gate, result) = self.begin(hash, FetchKind::Events, |b| b.events.clone());
        pass(gate).await;
        result
    }

    async fn raw_request(&self, method: &str, params: Value) -> ClientResult<Value> {
        let mut state = self.state();
        state.rpc_calls.push(method.to_string());
        match method {
            ARCHIVE_HASH_BY_HEIGHT => {
                if state.archive_unsupported {
                    return Err(ChainClientError::Unsupported {
                        method: method.to_string(),
                    });
                }
                let hashes: Vec<BlockHash> = params[0]
                    .as_u64()
                    .and_then(|height| state.archive.get(&height))
                    .into_iter()
                    .copied()
                    .collect();
                Ok(json!(hashes))
            }
            CHAIN_GET_BLOCK => {
                let hash: BlockHash = serde_json::from_value(params[0].clone())?;
                match state.rpc_blocks.get_mut(&hash) {
                    Some((_, nulls)) if *nulls > 0 => {
                        *nulls -= 1;
                        Ok(Value::Null)
                    }
                    Some((response, _)) => Ok(response.clone()),
                    None => Ok(Value::Null),
                }
            }
            _ => Err(ChainClientError::Unsupported {
                method: method.to_string(),
            }),
        }
    }

    async fn block_hash_at(&self, height: u64) -> ClientResult<Option<BlockHash>> {
        Ok(self.state().storage.get(&height).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_blocks_are_not_found() {
        let client = MockChainClient::new();
        let err = client.fetch_header(hash(1)).await.unwrap_err();
        assert_eq!(err, ChainClientError::NotFound { hash: hash(1) });
        assert_eq!(client.fetch_count(&hash(1), FetchKind::Header), 1);
    }

    #[tokio::test]
    async fn streams_can_be_taken_once() {
        let client = MockChainClient::new();
        client.finalize(block_ref(1, 0, 1));
        let mut first = client.finalized_blocks();
        assert_eq!(first.next().await.unwrap().unwrap(), block_ref(1, 0, 1));
        let mut second = client.finalized_blocks();
        assert!(second.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn rpc_block_answers_null_first() {
        let client = MockChainClient::new();
        let block = block_ref(3, 2, 3);
        client.set_rpc_block(block.hash, rpc_block(&block, 1), 1);
        let params = json!([block.hash]);
        assert!(client.raw_request(CHAIN_GET_BLOCK, params.clone()).await.unwrap().is_null());
        let value = client.raw_request(CHAIN_GET_BLOCK, params).await.unwrap();
        assert_eq!(value["block"]["header"]["number"], "0x3");
    }
}
