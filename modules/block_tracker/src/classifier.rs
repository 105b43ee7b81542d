//! Block status classification against the best chain and finalized set.

use agora_common::{BlockHash, BlockRef, BlockStatus};

use crate::finalized_index::FinalizedIndex;

/// Classify one block.
///
/// `best_chain` runs from the best tip back to the finalized tip, so its last
/// entry is the finalized tip. Returns `None` while no best chain is known.
pub fn classify(
    best_chain: &[BlockRef],
    finalized: &FinalizedIndex,
    number: u64,
    hash: &BlockHash,
) -> Option<BlockStatus> {
    let finalized_tip = best_chain.last()?;

    let status = if number == finalized_tip.number {
        if *hash == finalized_tip.hash {
            BlockStatus::Finalized
        } else {
            BlockStatus::Pruned
        }
    } else if number > finalized_tip.number {
        if best_chain.iter().any(|b| b.hash == *hash) {
            BlockStatus::Best
        } else {
            BlockStatus::Fork
        }
    } else if finalized.contains(hash) {
        BlockStatus::Finalized
    } else {
        // Never guess Fork or Pruned below the tip without proof
        BlockStatus::Unknown
    };

    Some(status)
}

/// Classify and back-fill the parent into the finalized index.
///
/// Finalization comes in batches, so a finalized block's parent is recorded
/// as finalized at `number - 1` to let ancestors that were never announced
/// individually classify as finalized later.
pub fn evaluate(
    best_chain: &[BlockRef],
    finalized: &FinalizedIndex,
    block: &BlockRef,
) -> Option<BlockStatus> {
    let status = classify(best_chain, finalized, block.number, &block.hash)?;
    if status == BlockStatus::Finalized && block.number > 0 {
        finalized.insert(block.parent, block.number - 1);
    }
    Some(status)
}
