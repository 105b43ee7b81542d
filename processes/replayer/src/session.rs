//! Recorded chain-head session file format.

use std::collections::{BTreeMap, HashMap};
use std::fs::read_to_string;
use std::path::Path;

use agora_common::{BlockAnnouncement, BlockHash, BlockHeader, BlockRef, EventRecord, Extrinsic};
use anyhow::{Context, Result};
use serde_json::Value;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Session {
    /// Blocks the node can serve directly
    #[serde(default)]
    pub blocks: Vec<RecordedBlock>,

    /// `chain_getBlock` answers for blocks the node no longer pins
    #[serde(default)]
    pub rpc_blocks: HashMap<BlockHash, Value>,

    /// `archive_v1_hashByHeight` answers
    #[serde(default)]
    pub archive_hashes: BTreeMap<u64, BlockHash>,

    /// `System.BlockHash` storage entries
    #[serde(default)]
    pub storage_hashes: BTreeMap<u64, BlockHash>,

    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RecordedBlock {
    #[serde(flatten)]
    pub block: BlockRef,
    pub header: Option<BlockHeader>,
    #[serde(default)]
    pub body: Vec<Extrinsic>,
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    /// Pause before this step
    #[serde(default)]
    pub delay_ms: u64,

    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Best chain, tip first, finalized tip last
    Best(Vec<BlockRef>),
    Finalized(BlockRef),
    Announce(BlockAnnouncement),
    /// Ask the tracker for a block by hash or height
    Lookup(String),
}

impl Session {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            read_to_string(path).with_context(|| format!("Failed to read session {path:?}"))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse session {path:?}"))
    }
}
