//! Moving the UTXO state between two points of the block tree.
//!
//! A reorganization is planned from the chain index (fork point plus the
//! blocks to disconnect and connect) and then executed against a working
//! overlay. Nothing committed changes here; the caller commits the overlay's
//! changes or drops them.

use crate::block::connect_block_checks;
use crate::chain_index::ChainIndex;
use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::script_check::ScriptChecker;
use crate::serialization::hash_to_hex;
use crate::store::ChainStore;
use crate::types::*;
use crate::utxo::{apply_block, block_delta, undo_block, UtxoChanges, UtxoOverlay, UtxoView};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPlan {
    pub fork: Hash,
    pub fork_height: Height,
    /// From the old tip down to (excluding) the fork
    pub disconnect: Vec<Hash>,
    /// From just above the fork up to the new tip
    pub connect: Vec<Hash>,
}

impl ReorgPlan {
    pub fn is_empty(&self) -> bool {
        self.disconnect.is_empty() && self.connect.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.disconnect.len()
    }
}

/// Compute the fork point between `from` and `to` and both paths.
pub fn plan_reorg(index: &ChainIndex, from: &Hash, to: &Hash) -> Result<ReorgPlan> {
    let fork = index.find_fork(from, to).ok_or_else(|| {
        ConsensusError::Corruption(format!(
            "no common ancestor for {} and {}",
            hash_to_hex(from),
            hash_to_hex(to)
        ))
    })?;
    let fork_hash = fork.hash;
    let fork_height = fork.height;

    let walk_down = |start: &Hash| -> Result<Vec<Hash>> {
        let mut path = Vec::new();
        let mut cursor = *start;
        while cursor != fork_hash {
            let node = index
                .get(&cursor)
                .ok_or_else(|| ConsensusError::Corruption(format!("unknown block {}", hash_to_hex(&cursor))))?;
            path.push(cursor);
            cursor = node
                .parent
                .ok_or_else(|| ConsensusError::Corruption("walked past genesis".to_string()))?;
        }
        Ok(path)
    };

    let disconnect = walk_down(from)?;
    let mut connect = walk_down(to)?;
    connect.reverse();
    Ok(ReorgPlan { fork: fork_hash, fork_height, disconnect, connect })
}

/// One block moved on or off the active chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransition {
    pub hash: Hash,
    pub height: Height,
    pub block: Arc<Block>,
    pub undo: BlockUndo,
}

impl BlockTransition {
    pub fn delta(&self) -> UtxoDelta {
        block_delta(&self.block, self.height, &self.undo)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReorgOutcome {
    pub changes: UtxoChanges,
    pub disconnected: Vec<BlockTransition>,
    pub connected: Vec<BlockTransition>,
}

/// A plan that could not be carried out. `failed` names the block that broke
/// consensus; `None` means the stored data itself is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgFailure {
    pub failed: Option<Hash>,
    pub error: ConsensusError,
}

impl ReorgFailure {
    fn storage(error: ConsensusError) -> Self {
        ReorgFailure { failed: None, error }
    }
}

/// How much checking connected blocks receive.
#[derive(Debug, Clone, Copy)]
pub enum Revalidation<'a> {
    /// Blocks are known valid; only apply them
    None,
    /// Full per-transaction checks, except for `skip`, which was just
    /// validated against this same parent state
    Full { checker: &'a ScriptChecker, skip: Option<Hash> },
}

fn load_block<S: ChainStore + ?Sized>(store: &S, hash: &Hash) -> std::result::Result<Arc<Block>, ReorgFailure> {
    match store.load_block(hash) {
        Ok(Some(block)) => Ok(Arc::new(block)),
        Ok(None) => Err(ReorgFailure::storage(ConsensusError::Corruption(format!(
            "block {} missing from store",
            hash_to_hex(hash)
        )))),
        Err(e) => Err(ReorgFailure::storage(e)),
    }
}

/// Execute `plan` over `base`: undo the abandoned blocks in descending
/// height, then connect the new branch. Any failure discards all work.
pub fn execute_plan<V: UtxoView + ?Sized, S: ChainStore + ?Sized>(
    plan: &ReorgPlan,
    index: &ChainIndex,
    base: &V,
    store: &S,
    params: &ChainParams,
    revalidation: Revalidation<'_>,
) -> std::result::Result<ReorgOutcome, ReorgFailure> {
    let mut overlay = UtxoOverlay::new(base);
    let mut disconnected = Vec::with_capacity(plan.disconnect.len());
    let mut connected = Vec::with_capacity(plan.connect.len());

    for hash in &plan.disconnect {
        let height = index
            .get(hash)
            .map(|n| n.height)
            .ok_or_else(|| ReorgFailure::storage(ConsensusError::Corruption("unknown block".to_string())))?;
        let block = load_block(store, hash)?;
        let undo = match store.load_undo(hash) {
            Ok(Some(undo)) => undo,
            Ok(None) => {
                return Err(ReorgFailure::storage(ConsensusError::Corruption(format!(
                    "undo data for {} missing",
                    hash_to_hex(hash)
                ))))
            }
            Err(e) => return Err(ReorgFailure::storage(e)),
        };
        undo_block(&mut overlay, &block, &undo).map_err(ReorgFailure::storage)?;
        disconnected.push(BlockTransition { hash: *hash, height, block, undo });
    }

    for hash in &plan.connect {
        let height = index
            .get(hash)
            .map(|n| n.height)
            .ok_or_else(|| ReorgFailure::storage(ConsensusError::Corruption("unknown block".to_string())))?;
        let block = load_block(store, hash)?;
        let poisoned = |error: ConsensusError| ReorgFailure { failed: Some(*hash), error };

        if let Revalidation::Full { checker, skip } = revalidation {
            if skip != Some(*hash) {
                connect_block_checks(&block, height, &overlay, params, checker).map_err(poisoned)?;
            }
        }
        let duplicates = params.duplicate_outputs(height, hash);
        let undo = apply_block(&mut overlay, &block, height, duplicates).map_err(poisoned)?;
        connected.push(BlockTransition { hash: *hash, height, block, undo });
    }

    Ok(ReorgOutcome { changes: overlay.into_changes(), disconnected, connected })
}
