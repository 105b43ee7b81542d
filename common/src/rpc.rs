//! Response shapes of the low level JSON-RPC methods used as fallbacks.

use serde_json::Value;

use crate::{error::ChainClientError, BlockHash, BlockHeader, Extrinsic};

pub const CHAIN_GET_BLOCK: &str = "chain_getBlock";
pub const ARCHIVE_HASH_BY_HEIGHT: &str = "archive_v1_hashByHeight";

/// `chain_getBlock` result
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcSignedBlock {
    pub block: RpcBlock,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcBlock {
    pub extrinsics: Vec<Extrinsic>,
    pub header: RpcHeader,
}

/// Header as the RPC layer returns it: numbers are hex quantities
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    pub parent_hash: BlockHash,
    pub number: String,
    pub state_root: BlockHash,
    pub extrinsics_root: BlockHash,
    pub digest: RpcDigest,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RpcDigest {
    #[serde(default)]
    pub logs: Vec<Value>,
}

/// Parse a JSON-RPC hex quantity such as `0x1a`
pub fn parse_quantity(quantity: &str) -> Result<u64, ChainClientError> {
    let digits = quantity.strip_prefix("0x").unwrap_or(quantity);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainClientError::Decode(format!("bad quantity '{quantity}': {e}")))
}

impl RpcHeader {
    pub fn to_header(&self) -> Result<BlockHeader, ChainClientError> {
        Ok(BlockHeader {
            parent_hash: self.parent_hash,
            number: parse_quantity(&self.number)?,
            state_root: self.state_root,
            extrinsics_root: self.extrinsics_root,
            digests: self.digest.logs.clone(),
        })
    }
}

impl RpcSignedBlock {
    /// Decode a `chain_getBlock` result; `Ok(None)` for a null result
    pub fn from_value(value: Value) -> Result<Option<Self>, ChainClientError> {
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}

/// Decode an `archive_v1_hashByHeight` result, taking the first hash
pub fn first_hash(value: Value) -> Result<Option<BlockHash>, ChainClientError> {
    if value.is_null() {
        return Ok(None);
    }
    let hashes: Vec<BlockHash> = serde_json::from_value(value)?;
    Ok(hashes.into_iter().next())
}
