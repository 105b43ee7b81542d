//! Core type definitions for Agora

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::hash::BlockHash;

/// Where a block stands relative to the best chain and finalization
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Fork,      // Above the finalized tip, not on the best chain
    Best,      // Above the finalized tip, on the best chain
    Finalized, // Finalized (terminal)
    Pruned,    // Lost to the finalized block at its height (terminal)
    #[default]
    Unknown, // Cannot currently be proven either way
}

impl BlockStatus {
    /// Finalized and Pruned never change again for a given hash
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockStatus::Finalized | BlockStatus::Pruned)
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStatus::Fork => write!(f, "fork"),
            BlockStatus::Best => write!(f, "best"),
            BlockStatus::Finalized => write!(f, "finalized"),
            BlockStatus::Pruned => write!(f, "pruned"),
            BlockStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Identity of a block as emitted by the client's block streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockRef {
    /// Block hash
    pub hash: BlockHash,

    /// Parent block hash
    pub parent: BlockHash,

    /// Block height
    pub number: u64,
}

/// Chain-head announcement, in arrival order
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BlockAnnouncement {
    /// A block was added to the node's tree
    NewBlock(BlockRef),

    /// (Re)connected; the node's finalized block is at this height
    #[serde(rename_all = "camelCase")]
    Initialized { finalized_number: u64 },

    /// A block was finalized
    Finalized { hash: BlockHash },

    /// The node no longer holds these blocks
    Unpinned { hashes: Vec<BlockHash> },
}

/// Structured block header
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub parent_hash: BlockHash,
    pub number: u64,
    pub state_root: BlockHash,
    pub extrinsics_root: BlockHash,
    /// Digest log items, as delivered by the client
    pub digests: Vec<Value>,
}

/// Opaque encoded extrinsic
pub type Extrinsic = String;

/// Per-storage-key (before, after) values; reserved
pub type StateDiff = BTreeMap<String, (Option<String>, Option<String>)>;

/// When an event was raised during block execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Phase {
    /// While applying the extrinsic at this index
    ApplyExtrinsic(u32),
    /// During block finalization
    Finalization,
    /// During block initialization
    Initialization,
}

impl fmt::Display for Phase {
    /// Short form used for grouping keys: index, `i` or `f`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::ApplyExtrinsic(index) => write!(f, "{index}"),
            Phase::Initialization => write!(f, "i"),
            Phase::Finalization => write!(f, "f"),
        }
    }
}

/// A runtime event: pallet, variant and decoded payload
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChainEvent {
    pub pallet: String,
    pub variant: String,
    #[serde(default)]
    pub data: Value,
}

/// Dispatch metadata carried by `ExtrinsicSuccess`-style events
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub ref_time: Option<String>,
    pub proof_size: Option<String>,
    pub class: Option<String>,
    pub pays_fee: Option<String>,
}

impl ChainEvent {
    pub fn new(pallet: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            pallet: pallet.into(),
            variant: variant.into(),
            data: Value::Null,
        }
    }

    /// `Pallet.Variant`
    pub fn name(&self) -> String {
        format!("{}.{}", self.pallet, self.variant)
    }

    /// Extract `dispatch_info` details from the payload, if present
    pub fn dispatch_info(&self) -> Option<DispatchSummary> {
        let info = self.data.get("dispatch_info")?;
        let text = |v: Option<&Value>| -> Option<String> {
            match v? {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            }
        };
        let weight = info.get("weight");
        Some(DispatchSummary {
            ref_time: text(weight.and_then(|w| w.get("ref_time"))),
            proof_size: text(weight.and_then(|w| w.get("proof_size"))),
            class: text(info.get("class").and_then(|c| c.get("type"))),
            pays_fee: text(info.get("pays_fee").and_then(|p| p.get("type"))),
        })
    }
}

/// An event with its phase metadata
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub phase: Phase,
    pub event: ChainEvent,
    #[serde(default)]
    pub topics: Vec<BlockHash>,
}

impl EventRecord {
    pub fn new(phase: Phase, event: ChainEvent) -> Self {
        Self {
            phase,
            event,
            topics: Vec::new(),
        }
    }

    /// Human readable phase, e.g. `Extrinsic #2`
    pub fn phase_label(&self) -> String {
        match self.phase {
            Phase::ApplyExtrinsic(index) => format!("Extrinsic #{index}"),
            Phase::Initialization => "Initialization".to_string(),
            Phase::Finalization => "Finalization".to_string(),
        }
    }
}

/// Everything known about one block, filled in channel by channel
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockRecord {
    /// Block hash
    pub hash: BlockHash,

    /// Parent block hash
    pub parent: BlockHash,

    /// Block height
    pub number: u64,

    /// Extrinsics; `None` while loading or after a failed fetch
    pub body: Option<Vec<Extrinsic>>,

    /// Events; `None` while loading or after a failed fetch
    pub events: Option<Vec<EventRecord>>,

    /// Header; `None` while loading or after a failed fetch
    pub header: Option<BlockHeader>,

    /// Current status
    pub status: BlockStatus,

    /// Reserved for state diffs, always `None`
    pub diff: Option<StateDiff>,
}

impl BlockRecord {
    /// Empty record for a freshly announced block
    pub fn new(block: BlockRef) -> Self {
        Self {
            hash: block.hash,
            parent: block.parent,
            number: block.number,
            body: None,
            events: None,
            header: None,
            status: BlockStatus::Unknown,
            diff: None,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            hash: self.hash,
            parent: self.parent,
            number: self.number,
        }
    }

    /// No further updates can change what consumers derive from this record
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.events.is_some()
    }

    pub fn extrinsic_count(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    pub fn event_count(&self) -> usize {
        self.events.as_ref().map_or(0, Vec::len)
    }
}
