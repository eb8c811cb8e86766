//! Chain state: the block tree, the active chain, the committed UTXO set and
//! the rules for moving between them.
//!
//! Blocks arrive through [`ChainState::process_block`]. Each is checked
//! structurally, then against its parent's context and its parent's UTXO
//! state, and finally chain selection decides whether the active chain
//! moves. All UTXO and tip changes for one move are committed to the store
//! in a single batch.

use crate::block::{
    check_block, check_header_time, connect_block_checks, contextual_check_block, contextual_check_header,
    merkle_commits_body,
};
use crate::chain_index::{ActiveChain, BlockStatus, ChainIndex, ChainNode};
use crate::config::NodeConfig;
use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::pow::check_proof_of_work;
use crate::reorganization::{execute_plan, plan_reorg, BlockTransition, ReorgFailure, ReorgOutcome, Revalidation};
use crate::script_check::ScriptChecker;
use crate::serialization::{block_hash, hash_to_hex};
use crate::store::ChainStore;
use crate::types::*;
use crate::utxo::{UtxoChanges, UtxoOverlay, UtxoSet};
use log::{debug, error, info, warn};
use lru::LruCache;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" for the future-timestamp rule.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicU64);

impl FixedClock {
    pub fn new(now: u64) -> Self {
        FixedClock(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to a block that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// On the active chain after processing
    Active,
    /// Valid but not on the active chain
    SideBranch,
    AlreadyKnown,
}

/// One move of the active tip.
#[derive(Debug, Clone)]
pub struct TipUpdate {
    pub old_tip: Hash,
    pub new_tip: Hash,
    pub height: Height,
    pub fork: Hash,
    /// Highest first
    pub disconnected: Vec<BlockTransition>,
    /// Lowest first
    pub connected: Vec<BlockTransition>,
}

impl TipUpdate {
    pub fn is_reorg(&self) -> bool {
        !self.disconnected.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BlockResult {
    pub hash: Hash,
    pub acceptance: BlockAcceptance,
    pub updates: Vec<TipUpdate>,
    /// Held blocks that became connectable and were processed as well
    pub resolved_orphans: Vec<Hash>,
}

/// Blocks whose parent has no validated body yet, evicted oldest first.
#[derive(Debug, Default)]
struct OrphanPool {
    blocks: HashMap<Hash, Arc<Block>>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl OrphanPool {
    fn new(capacity: usize) -> Self {
        OrphanPool { capacity, ..Default::default() }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn insert(&mut self, hash: Hash, block: Arc<Block>) {
        if self.capacity == 0 || self.blocks.contains_key(&hash) {
            return;
        }
        while self.blocks.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.remove(&oldest) {
                        debug!("evicted orphan block {}", hash_to_hex(&oldest));
                    }
                }
                None => break,
            }
        }
        self.by_parent.entry(block.header.prev_block_hash).or_default().push(hash);
        self.order.push_back(hash);
        self.blocks.insert(hash, block);
    }

    fn remove(&mut self, hash: &Hash) -> bool {
        let Some(block) = self.blocks.remove(hash) else {
            return false;
        };
        let parent = block.header.prev_block_hash;
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        true
    }

    fn take_children(&mut self, parent: &Hash) -> Vec<(Hash, Arc<Block>)> {
        let hashes = self.by_parent.remove(parent).unwrap_or_default();
        self.order.retain(|h| !hashes.contains(h));
        hashes
            .into_iter()
            .filter_map(|h| self.blocks.remove(&h).map(|b| (h, b)))
            .collect()
    }
}

pub struct ChainState<S: ChainStore> {
    params: ChainParams,
    config: NodeConfig,
    index: ChainIndex,
    active: ActiveChain,
    utxos: UtxoSet,
    store: S,
    orphans: OrphanPool,
    rejected: LruCache<Hash, ConsensusError>,
    checker: ScriptChecker,
    clock: Arc<dyn Clock>,
    halted: Option<String>,
    /// Tip moves committed by calls that then returned an error
    unreported: Vec<TipUpdate>,
}

impl<S: ChainStore> fmt::Debug for ChainState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainState")
            .field("chain", &self.params.name)
            .field("tip", &hash_to_hex(&self.tip_hash()))
            .field("height", &self.tip_height())
            .field("utxos", &self.utxos.len())
            .field("orphans", &self.orphans.len())
            .field("halted", &self.halted)
            .finish()
    }
}

fn stage_and_commit<S: ChainStore>(store: &mut S, outcome: &ReorgOutcome, new_tip: &Hash) -> Result<()> {
    store.begin_apply()?;
    store.stage_utxo_changes(&outcome.changes)?;
    for block in &outcome.disconnected {
        store.stage_remove_undo(&block.hash)?;
    }
    for block in &outcome.connected {
        store.stage_undo(&block.hash, &block.undo)?;
    }
    store.stage_tip(new_tip)?;
    store.commit()
}

fn descends_from_invalid(hash: &Hash) -> ConsensusError {
    ConsensusError::ConsensusInvalid(format!("block {} descends from an invalid block", hash_to_hex(hash)))
}

impl<S: ChainStore> ChainState<S> {
    /// Open with the built-in script verifier and the system clock.
    pub fn open(params: ChainParams, config: NodeConfig, store: S) -> Result<Self> {
        let checker = ScriptChecker::standard(&config.scripts);
        Self::open_with(params, config, store, checker, Arc::new(SystemClock))
    }

    /// Resume from the store's last commit, or initialize it with genesis.
    pub fn open_with(
        params: ChainParams,
        config: NodeConfig,
        mut store: S,
        checker: ScriptChecker,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let genesis = params.genesis_block();
        let genesis_hash = block_hash(&genesis.header);

        let nodes = store.load_index()?;
        let (index, utxos, tip) = if nodes.is_empty() {
            let index = ChainIndex::new(&genesis.header);
            store.store_block(&genesis_hash, &genesis)?;
            for node in index.nodes() {
                store.put_index_entry(node)?;
            }

            let mut utxos = UtxoSet::new();
            let undo = utxos.apply_block(&genesis, 0)?;
            let changes: UtxoChanges = utxos.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect();
            store.begin_apply()?;
            store.stage_utxo_changes(&changes)?;
            store.stage_undo(&genesis_hash, &undo)?;
            store.stage_tip(&genesis_hash)?;
            store.commit()?;
            info!("initialized {} chain at genesis {}", params.name, hash_to_hex(&genesis_hash));
            (index, utxos, genesis_hash)
        } else {
            let index = ChainIndex::from_nodes(nodes)?;
            if index.genesis_hash() != genesis_hash {
                return Err(ConsensusError::Config(format!(
                    "store was created for a chain with genesis {}",
                    hash_to_hex(&index.genesis_hash())
                )));
            }
            let tip = store
                .load_tip()?
                .ok_or_else(|| ConsensusError::Corruption("store has an index but no tip".to_string()))?;
            let utxos = UtxoSet::from_entries(store.load_utxos()?);
            (index, utxos, tip)
        };

        let active = ActiveChain::from_tip(&index, &tip)?;
        let cache_size = NonZeroUsize::new(config.chain.rejected_cache_size).unwrap_or(NonZeroUsize::MIN);
        let mut state = ChainState {
            orphans: OrphanPool::new(config.chain.max_orphan_blocks),
            rejected: LruCache::new(cache_size),
            params,
            config,
            index,
            active,
            utxos,
            store,
            checker,
            clock,
            halted: None,
            unreported: Vec::new(),
        };
        info!(
            "chain state at height {} tip {} with {} unspent outputs",
            state.tip_height(),
            hash_to_hex(&tip),
            state.utxos.len()
        );

        // A validated block may have outlived the commit that would have activated it.
        state.activate_best_chain(None)?;
        Ok(state)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn script_checker(&self) -> &ScriptChecker {
        &self.checker
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn tip_hash(&self) -> Hash {
        self.active.tip().copied().unwrap_or_else(|| self.index.genesis_hash())
    }

    pub fn tip_height(&self) -> Height {
        self.active.height()
    }

    pub fn tip(&self) -> Option<&ChainNode> {
        self.index.get(&self.tip_hash())
    }

    pub fn tip_median_time_past(&self) -> u32 {
        self.index.median_time_past(&self.tip_hash())
    }

    pub fn hash_at(&self, height: Height) -> Option<Hash> {
        self.active.at(height).copied()
    }

    pub fn is_active(&self, hash: &Hash) -> bool {
        self.index.get(hash).map(|n| self.active.contains(n)).unwrap_or(false)
    }

    pub fn block(&self, hash: &Hash) -> Result<Option<Block>> {
        self.store.load_block(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(ConsensusError::StorageFatal(format!("node halted: {}", reason))),
            None => Ok(()),
        }
    }

    fn halt(&mut self, e: ConsensusError) -> ConsensusError {
        error!("halting chain state: {}", e);
        self.halted = Some(e.to_string());
        e
    }

    /// Pass through `result`, halting first if its error is fatal.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| if e.is_fatal() { self.halt(e) } else { e })
    }

    fn persist_node(&mut self, hash: &Hash) -> Result<()> {
        let node = self
            .index
            .get(hash)
            .cloned()
            .ok_or_else(|| ConsensusError::Corruption(format!("unknown block {}", hash_to_hex(hash))));
        let result = node.and_then(|node| self.store.put_index_entry(&node));
        self.guard(result)
    }

    /// Take the tip moves that were committed by calls which then failed.
    /// `process_block` and `activate_best_chain` leave them here instead of
    /// dropping them with the error.
    pub fn take_unreported_updates(&mut self) -> Vec<TipUpdate> {
        std::mem::take(&mut self.unreported)
    }

    fn invalidate(&mut self, hash: &Hash) -> Result<()> {
        let marked = self.index.mark_invalid_subtree(hash);
        warn!("marked {} block(s) invalid from {}", marked.len(), hash_to_hex(hash));
        for h in &marked {
            self.persist_node(h)?;
        }

        // held blocks can never connect below an invalid block
        let mut queue = marked;
        while let Some(parent) = queue.pop() {
            for (child, _) in self.orphans.take_children(&parent) {
                debug!("dropping held block {} below invalid {}", hash_to_hex(&child), hash_to_hex(&parent));
                self.rejected.put(child, descends_from_invalid(&child));
                queue.push(child);
            }
        }
        Ok(())
    }

    /// Index a header whose parent is known. Returns its hash.
    pub fn accept_header(&mut self, header: &BlockHeader) -> Result<Hash> {
        self.ensure_running()?;
        let hash = block_hash(header);
        if let Some(node) = self.index.get(&hash) {
            return match node.status {
                BlockStatus::Invalid => Err(ConsensusError::ConsensusInvalid(format!(
                    "header {} previously marked invalid",
                    hash_to_hex(&hash)
                ))),
                _ => Ok(hash),
            };
        }
        if let Some(err) = self.rejected.get(&hash) {
            return Err(err.clone());
        }
        if let Err(e) = check_proof_of_work(header, &self.params) {
            self.rejected.put(hash, e.clone());
            return Err(e);
        }
        check_header_time(header, &self.params, self.clock.now())?;

        let ctx = self.index.header_context(&header.prev_block_hash, &self.params)?;
        let verdict = contextual_check_header(header, &ctx, &self.params);
        self.index.insert_header(header)?;
        self.persist_node(&hash)?;
        if let Err(e) = verdict {
            self.invalidate(&hash)?;
            return Err(e);
        }
        debug!("accepted header {} at height {}", hash_to_hex(&hash), ctx.height);
        Ok(hash)
    }

    /// Validate a block, store it, and move the active chain if it now leads
    /// to the most work. Blocks waiting on this one are processed after it.
    ///
    /// On error, tip moves already committed by this call are kept for
    /// [`ChainState::take_unreported_updates`].
    pub fn process_block(&mut self, block: Block) -> Result<BlockResult> {
        self.ensure_running()?;
        let hash = block_hash(&block.header);
        let mut updates = Vec::new();
        match self.process_with_orphans(hash, Arc::new(block), &mut updates) {
            Ok((acceptance, resolved)) => Ok(BlockResult { hash, acceptance, updates, resolved_orphans: resolved }),
            Err(e) => {
                self.unreported.append(&mut updates);
                Err(e)
            }
        }
    }

    fn process_with_orphans(
        &mut self,
        hash: Hash,
        block: Arc<Block>,
        updates: &mut Vec<TipUpdate>,
    ) -> Result<(BlockAcceptance, Vec<Hash>)> {
        let accepted = self.accept_block(hash, block, updates)?;

        let mut resolved = Vec::new();
        let mut queue = vec![hash];
        while let Some(parent) = queue.pop() {
            for (child_hash, child) in self.orphans.take_children(&parent) {
                match self.accept_block(child_hash, child, updates) {
                    Ok(_) => {
                        resolved.push(child_hash);
                        queue.push(child_hash);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!("held block {} rejected: {}", hash_to_hex(&child_hash), e),
                }
            }
        }

        let acceptance = match accepted {
            BlockAcceptance::AlreadyKnown => BlockAcceptance::AlreadyKnown,
            _ if self.is_active(&hash) => BlockAcceptance::Active,
            _ => BlockAcceptance::SideBranch,
        };
        Ok((acceptance, resolved))
    }

    fn hold_orphan(&mut self, hash: Hash, block: Arc<Block>, reason: &str) -> ConsensusError {
        debug!("holding block {}: {}", hash_to_hex(&hash), reason);
        self.orphans.insert(hash, block);
        ConsensusError::Orphan(format!("block {} {}", hash_to_hex(&hash), reason))
    }

    fn accept_block(&mut self, hash: Hash, block: Arc<Block>, updates: &mut Vec<TipUpdate>) -> Result<BlockAcceptance> {
        if let Some(err) = self.rejected.get(&hash) {
            return Err(err.clone());
        }
        if let Some(node) = self.index.get(&hash) {
            match node.status {
                BlockStatus::FullyValidated => return Ok(BlockAcceptance::AlreadyKnown),
                BlockStatus::Invalid => {
                    return Err(ConsensusError::ConsensusInvalid(format!(
                        "block {} previously marked invalid",
                        hash_to_hex(&hash)
                    )))
                }
                BlockStatus::HeaderOnly => {}
            }
        }
        if self.orphans.contains(&hash) {
            return Err(ConsensusError::Orphan(format!("block {} already held", hash_to_hex(&hash))));
        }

        if let Err(e) = check_block(&block, &self.params) {
            if merkle_commits_body(&block) {
                self.rejected.put(hash, e.clone());
            }
            warn!("rejected malformed block {}: {}", hash_to_hex(&hash), e);
            return Err(e);
        }
        if let Err(e) = check_proof_of_work(&block.header, &self.params) {
            self.rejected.put(hash, e.clone());
            return Err(e);
        }
        check_header_time(&block.header, &self.params, self.clock.now())?;

        let parent_hash = block.header.prev_block_hash;
        let parent_status = self.index.get(&parent_hash).map(|p| p.status);
        match parent_status {
            None => return Err(self.hold_orphan(hash, block, "has an unknown parent")),
            Some(BlockStatus::HeaderOnly) => {
                return Err(self.hold_orphan(hash, block, "has a parent without a validated body"))
            }
            Some(BlockStatus::Invalid) => {
                let e = descends_from_invalid(&hash);
                self.rejected.put(hash, e.clone());
                return Err(e);
            }
            Some(BlockStatus::FullyValidated) => {}
        }

        let ctx = self.index.header_context(&parent_hash, &self.params)?;
        let contextual = contextual_check_header(&block.header, &ctx, &self.params)
            .and_then(|_| contextual_check_block(&block, ctx.height, &self.params));
        self.index.insert_header(&block.header)?;
        self.persist_node(&hash)?;
        if let Err(e) = contextual {
            warn!("block {} failed contextual checks: {}", hash_to_hex(&hash), e);
            self.invalidate(&hash)?;
            return Err(e);
        }

        let stored = self.store.store_block(&hash, &block);
        self.guard(stored)?;

        let changes = self.branch_changes(&parent_hash)?;
        let verdict = {
            let view = UtxoOverlay::with_changes(&self.utxos, changes);
            connect_block_checks(&block, ctx.height, &view, &self.params, &self.checker)
        };
        match verdict {
            Ok(v) => debug!(
                "block {} valid at height {} with {} fees, {} sigops",
                hash_to_hex(&hash),
                ctx.height,
                v.fees,
                v.sigops
            ),
            Err(e) => {
                warn!("block {} invalid: {}", hash_to_hex(&hash), e);
                self.invalidate(&hash)?;
                return Err(e);
            }
        }

        self.index.set_status(&hash, BlockStatus::FullyValidated)?;
        self.persist_node(&hash)?;
        self.activate_into(Some(hash), updates)?;
        if self.index.get(&hash).map(|n| n.status) == Some(BlockStatus::Invalid) {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "block {} invalid after re-validating its branch",
                hash_to_hex(&hash)
            )));
        }
        Ok(if self.is_active(&hash) { BlockAcceptance::Active } else { BlockAcceptance::SideBranch })
    }

    /// Changes that turn the committed set into the state at `target`.
    fn branch_changes(&mut self, target: &Hash) -> Result<UtxoChanges> {
        let tip = self.tip_hash();
        if *target == tip {
            return Ok(UtxoChanges::new());
        }
        let outcome = plan_reorg(&self.index, &tip, target).and_then(|plan| {
            execute_plan(&plan, &self.index, &self.utxos, &self.store, &self.params, Revalidation::None)
                .map_err(|failure| match failure.failed {
                    Some(bad) => ConsensusError::Corruption(format!(
                        "validated block {} no longer applies: {}",
                        hash_to_hex(&bad),
                        failure.error
                    )),
                    None => failure.error,
                })
        });
        match outcome {
            Ok(outcome) => Ok(outcome.changes),
            Err(e) => Err(self.halt(e)),
        }
    }

    /// Move the active chain to the best valid candidate, retrying with the
    /// next best whenever a block on the way turns out invalid.
    pub fn activate_best_chain(&mut self, just_validated: Option<Hash>) -> Result<Vec<TipUpdate>> {
        self.ensure_running()?;
        let mut updates = Vec::new();
        match self.activate_into(just_validated, &mut updates) {
            Ok(()) => Ok(updates),
            Err(e) => {
                self.unreported.append(&mut updates);
                Err(e)
            }
        }
    }

    fn activate_into(&mut self, just_validated: Option<Hash>, updates: &mut Vec<TipUpdate>) -> Result<()> {
        loop {
            let tip = match self.tip().cloned() {
                Some(tip) => tip,
                None => return Err(self.halt(ConsensusError::Corruption("active tip not indexed".to_string()))),
            };
            let best = match self.index.best_candidate() {
                Some(best) if best.hash != tip.hash && best.chain_work > tip.chain_work => best.clone(),
                _ => break,
            };

            let plan = match plan_reorg(&self.index, &tip.hash, &best.hash) {
                Ok(plan) => plan,
                Err(e) => return Err(self.halt(e)),
            };
            let revalidation = Revalidation::Full { checker: &self.checker, skip: just_validated };
            match execute_plan(&plan, &self.index, &self.utxos, &self.store, &self.params, revalidation) {
                Ok(outcome) => {
                    let committed = stage_and_commit(&mut self.store, &outcome, &best.hash);
                    if let Err(e) = committed {
                        self.store.abort();
                        return Err(self.halt(e));
                    }
                    updates.push(self.finish_transition(&tip, &best, plan.fork, outcome));
                }
                Err(ReorgFailure { failed: Some(bad), error }) => {
                    warn!(
                        "abandoning switch to {}: block {} invalid: {}",
                        hash_to_hex(&best.hash),
                        hash_to_hex(&bad),
                        error
                    );
                    self.invalidate(&bad)?;
                }
                Err(ReorgFailure { failed: None, error }) => return Err(self.halt(error)),
            }
        }
        Ok(())
    }

    fn finish_transition(&mut self, old: &ChainNode, new: &ChainNode, fork: Hash, outcome: ReorgOutcome) -> TipUpdate {
        let ReorgOutcome { changes, disconnected, connected } = outcome;
        self.utxos.apply_changes(changes);
        for _ in &disconnected {
            self.active.pop();
        }
        for block in &connected {
            self.active.push(block.hash);
        }

        if disconnected.is_empty() {
            info!("new tip {} at height {}", hash_to_hex(&new.hash), new.height);
        } else {
            info!(
                "reorganized from {} to {} at height {}: {} disconnected, {} connected",
                hash_to_hex(&old.hash),
                hash_to_hex(&new.hash),
                new.height,
                disconnected.len(),
                connected.len()
            );
        }
        TipUpdate { old_tip: old.hash, new_tip: new.hash, height: new.height, fork, disconnected, connected }
    }
}
