//! Resolution of blocks the live store does not hold.
//!
//! A block key is either a hash or a height. Heights are mapped to a hash
//! through the archive method, falling back to the `System.BlockHash` storage
//! item. The block itself is fetched through the client, and when the client
//! no longer has it, by polling `chain_getBlock` until the node answers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use agora_common::rpc::{self, RpcSignedBlock, ARCHIVE_HASH_BY_HEIGHT, CHAIN_GET_BLOCK};
use agora_common::{BlockHash, BlockRecord, BlockRef, ChainClient, ChainClientError};
use futures::StreamExt;
use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::chain_snapshots::ChainSnapshots;
use crate::configuration::ResolverConfig;
use crate::tracker_error::ResolveError;

/// Key a caller uses to ask for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKey {
    Hash(BlockHash),
    Height(u64),
}

impl BlockKey {
    /// Anything longer than 63 characters is a hash (with or without `0x`),
    /// anything shorter must be a decimal height
    pub fn parse(key: &str) -> Result<Self, ResolveError> {
        let key = key.trim();
        let invalid = || ResolveError::InvalidKey {
            key: key.to_string(),
        };
        if key.len() > 63 {
            return key.parse().map(BlockKey::Hash).map_err(|_| invalid());
        }
        key.parse().map(BlockKey::Height).map_err(|_| invalid())
    }
}

impl FromStr for BlockKey {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKey::Hash(hash) => write!(f, "{hash}"),
            BlockKey::Height(height) => write!(f, "{height}"),
        }
    }
}

#[derive(Clone)]
pub struct UnpinnedResolver {
    client: Arc<dyn ChainClient>,
    snapshots: ChainSnapshots,
    config: ResolverConfig,
}

impl UnpinnedResolver {
    pub fn new(client: Arc<dyn ChainClient>, snapshots: ChainSnapshots, config: ResolverConfig) -> Self {
        Self {
            client,
            snapshots,
            config,
        }
    }

    /// Map a key to a block hash
    pub async fn block_hash(&self, key: BlockKey) -> Result<BlockHash, ResolveError> {
        let height = match key {
            BlockKey::Hash(hash) => return Ok(hash),
            BlockKey::Height(height) => height,
        };

        let archived = self
            .client
            .raw_request(ARCHIVE_HASH_BY_HEIGHT, json!([height]))
            .await
            .and_then(rpc::first_hash);
        match archived {
            Ok(Some(hash)) => return Ok(hash),
            Ok(None) => debug!("{ARCHIVE_HASH_BY_HEIGHT} has nothing at {height}"),
            Err(e) => debug!("{ARCHIVE_HASH_BY_HEIGHT} failed at {height}: {e}"),
        }

        self.client
            .block_hash_at(height)
            .await?
            .ok_or(ResolveError::HeightNotFound { height })
    }

    /// Produce a complete record for `hash`, whatever the node still holds.
    /// Polling is bounded by `rpc-max-attempts` when set, otherwise it runs
    /// until the caller drops the future.
    pub async fn resolve(&self, hash: BlockHash) -> Result<BlockRecord, ResolveError> {
        self.resolve_within(hash, self.config.rpc_max_attempts).await
    }

    /// As [`Self::resolve`], for work with no caller to abandon it: polling
    /// always stops after `background-max-attempts`
    pub async fn resolve_in_background(&self, hash: BlockHash) -> Result<BlockRecord, ResolveError> {
        self.resolve_within(hash, Some(self.config.background_max_attempts)).await
    }

    async fn resolve_within(
        &self,
        hash: BlockHash,
        max_attempts: Option<u32>,
    ) -> Result<BlockRecord, ResolveError> {
        match self.fetch_direct(hash).await {
            Ok(record) => Ok(record),
            Err(e) => {
                debug!("Direct fetch of {hash} failed ({e}), polling {CHAIN_GET_BLOCK}");
                self.fetch_via_rpc(hash, max_attempts).await
            }
        }
    }

    async fn fetch_direct(&self, hash: BlockHash) -> Result<BlockRecord, ChainClientError> {
        let body = async {
            match self.client.watch_body(hash).next().await {
                Some(body) => body,
                None => Err(ChainClientError::StreamClosed(format!("body of {hash}"))),
            }
        };
        let (header, body, events) = tokio::try_join!(
            self.client.fetch_header(hash),
            body,
            self.client.fetch_events(hash)
        )?;

        let block = BlockRef {
            hash,
            parent: header.parent_hash,
            number: header.number,
        };
        let status = self.snapshots.classify_when_ready(&block).await;
        Ok(BlockRecord {
            body: Some(body),
            events: Some(events),
            header: Some(header),
            status,
            ..BlockRecord::new(block)
        })
    }

    /// Poll `chain_getBlock` until it yields a block. Transport errors count
    /// as an empty answer.
    async fn fetch_via_rpc(
        &self,
        hash: BlockHash,
        max_attempts: Option<u32>,
    ) -> Result<BlockRecord, ResolveError> {
        let mut ticker = interval(self.config.rpc_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            ticker.tick().await;
            attempts += 1;

            let response = self
                .client
                .raw_request(CHAIN_GET_BLOCK, json!([hash]))
                .await
                .and_then(RpcSignedBlock::from_value);
            match response {
                Ok(Some(signed)) => match signed.block.header.to_header() {
                    Ok(header) => {
                        let block = BlockRef {
                            hash,
                            parent: header.parent_hash,
                            number: header.number,
                        };
                        let status = self.snapshots.classify_when_ready(&block).await;
                        debug!("Resolved {hash} at {} via {CHAIN_GET_BLOCK}", block.number);
                        return Ok(BlockRecord {
                            body: Some(signed.block.extrinsics),
                            header: Some(header),
                            status,
                            ..BlockRecord::new(block)
                        });
                    }
                    Err(e) => warn!("Undecodable header for {hash}: {e}"),
                },
                Ok(None) => debug!("{CHAIN_GET_BLOCK} has nothing for {hash} yet"),
                Err(e) => warn!("{CHAIN_GET_BLOCK} failed for {hash}: {e}"),
            }

            if max_attempts.is_some_and(|max| attempts >= max) {
                return Err(ResolveError::RpcExhausted { attempts });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::BlockStatus;
    use agora_test_utils::{block_ref, hash, rpc_block, MockBlock, MockChainClient};
    use std::time::Duration;

    fn resolver(client: &Arc<MockChainClient>, max_attempts: Option<u32>) -> (UnpinnedResolver, ChainSnapshots) {
        let snapshots = ChainSnapshots::new();
        let config = ResolverConfig {
            rpc_poll_interval_ms: 1000,
            rpc_max_attempts: max_attempts,
            background_max_attempts: 3,
        };
        (UnpinnedResolver::new(client.clone(), snapshots.clone(), config), snapshots)
    }

    #[test]
    fn keys_parse_by_length() {
        let h = hash(5);
        assert_eq!(BlockKey::parse(&h.to_string()).unwrap(), BlockKey::Hash(h));
        let bare = h.to_string().trim_start_matches("0x").to_string();
        assert_eq!(bare.len(), 64);
        assert_eq!(BlockKey::parse(&bare).unwrap(), BlockKey::Hash(h));
        assert_eq!(BlockKey::parse("1234").unwrap(), BlockKey::Height(1234));
        assert!(matches!(BlockKey::parse("0x12"), Err(ResolveError::InvalidKey { .. })));
        assert!(matches!(
            BlockKey::parse(&"z".repeat(64)),
            Err(ResolveError::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn height_prefers_archive() {
        let client = MockChainClient::new();
        client.set_archive_hash(7, hash(7));
        client.set_storage_hash(7, hash(70));
        let (resolver, _) = resolver(&client, None);
        assert_eq!(resolver.block_hash(BlockKey::Height(7)).await.unwrap(), hash(7));
    }

    #[tokio::test]
    async fn height_falls_back_to_storage() {
        let client = MockChainClient::new();
        client.set_archive_unsupported();
        client.set_storage_hash(1, hash(1));
        let (resolver, _) = resolver(&client, None);
        assert_eq!(resolver.block_hash(BlockKey::Height(1)).await.unwrap(), hash(1));
        assert!(matches!(
            resolver.block_hash(BlockKey::Height(2)).await,
            Err(ResolveError::HeightNotFound { height: 2 })
        ));
    }

    #[tokio::test]
    async fn resolves_directly_when_client_has_block() {
        let client = MockChainClient::new();
        let block = block_ref(20, 19, 20);
        client.add_block(MockBlock::new(block));
        let (resolver, snapshots) = resolver(&client, None);
        snapshots.publish_finalized(block);
        snapshots.publish_best(vec![block_ref(21, 20, 21), block]);

        let record = resolver.resolve(block.hash).await.unwrap();
        assert_eq!(record.number, 20);
        assert_eq!(record.status, BlockStatus::Finalized);
        assert!(record.events.is_some());
        assert!(client.rpc_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_rpc_polling() {
        let client = MockChainClient::new();
        let block = block_ref(1, 0, 1);
        client.set_rpc_block(block.hash, rpc_block(&block, 2), 2);
        let (resolver, snapshots) = resolver(&client, None);
        snapshots.publish_best(vec![block_ref(30, 29, 30)]);

        let record = resolver.resolve(block.hash).await.unwrap();
        assert_eq!(record.number, 1);
        assert_eq!(record.parent, block.parent);
        assert_eq!(record.extrinsic_count(), 2);
        assert!(record.events.is_none());
        assert_eq!(record.status, BlockStatus::Unknown);
        assert_eq!(client.rpc_calls(), vec![CHAIN_GET_BLOCK.to_string(); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_polling_gives_up_when_capped() {
        let client = MockChainClient::new();
        let (resolver, snapshots) = resolver(&client, Some(3));
        snapshots.publish_best(vec![block_ref(30, 29, 30)]);

        let started = tokio::time::Instant::now();
        let result = resolver.resolve(hash(404)).await;
        assert!(matches!(result, Err(ResolveError::RpcExhausted { attempts: 3 })));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn background_resolution_is_always_bounded() {
        let client = MockChainClient::new();
        let (resolver, snapshots) = resolver(&client, None);
        snapshots.publish_best(vec![block_ref(30, 29, 30)]);

        let result = resolver.resolve_in_background(hash(404)).await;
        assert!(matches!(result, Err(ResolveError::RpcExhausted { attempts: 3 })));
        assert_eq!(client.rpc_calls().len(), 3);
    }
}
