//! Single-writer node: owns the chain state and the mempool, runs every
//! transition under one lock, publishes frozen snapshots for readers and
//! emits sequenced events for each change.

use crate::chainstate::{BlockResult, ChainState, TipUpdate};
use crate::config::NodeConfig;
use crate::constants::STANDARD_SCRIPT_VERIFY_FLAGS;
use crate::error::{ConsensusError, Result};
use crate::events::{ChainEvent, EventBus, SequencedEvent};
use crate::mempool::{AcceptOptions, Admission, Eviction, Mempool, MempoolContext, MempoolEntry};
use crate::params::ChainParams;
use crate::serialization::hash_to_hex;
use crate::store::ChainStore;
use crate::transaction::script_checks;
use crate::types::*;
use crate::utxo::{UtxoSet, UtxoView};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Frozen view of the active chain after a commit.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub tip: Hash,
    pub height: Height,
    pub median_time_past: u32,
    pub utxos: UtxoSet,
}

impl UtxoView for ChainSnapshot {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.utxos.get_utxo(outpoint)
    }

    fn contains_utxo(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_utxo(outpoint)
    }
}

struct NodeState<S: ChainStore> {
    chain: ChainState<S>,
    mempool: Mempool,
}

impl<S: ChainStore> NodeState<S> {
    fn mempool_context(&self) -> MempoolContext {
        let spend_height = self.chain.tip_height() + 1;
        MempoolContext {
            spend_height,
            median_time_past: self.chain.tip_median_time_past(),
            flags: self.chain.params().script_flags(spend_height) | STANDARD_SCRIPT_VERIFY_FLAGS,
        }
    }

    fn accept(&mut self, tx: Transaction, options: AcceptOptions) -> Result<Admission> {
        let ctx = self.mempool_context();
        let NodeState { chain, mempool } = self;
        mempool.accept(tx, chain.utxos(), &ctx, chain.params(), chain.script_checker(), options)
    }
}

fn snapshot_of<S: ChainStore>(chain: &ChainState<S>) -> ChainSnapshot {
    ChainSnapshot {
        tip: chain.tip_hash(),
        height: chain.tip_height(),
        median_time_past: chain.tip_median_time_past(),
        utxos: chain.utxos().snapshot(),
    }
}

fn accepted_event(entry: &MempoolEntry) -> ChainEvent {
    ChainEvent::TransactionAccepted { txid: entry.txid, tx: entry.tx.clone(), fee: entry.fee, fee_rate: entry.fee_rate }
}

fn evicted_event(eviction: Eviction) -> ChainEvent {
    ChainEvent::TransactionEvicted { txid: eviction.entry.txid, tx: eviction.entry.tx, reason: eviction.reason }
}

fn admission_events(admission: Admission, events: &mut Vec<ChainEvent>) -> MempoolEntry {
    events.extend(admission.evicted.into_iter().map(evicted_event));
    events.push(accepted_event(&admission.entry));
    admission.entry
}

pub struct Node<S: ChainStore> {
    state: Mutex<NodeState<S>>,
    snapshot: RwLock<Arc<ChainSnapshot>>,
    events: EventBus,
}

impl<S: ChainStore> Node<S> {
    pub fn open(params: ChainParams, config: NodeConfig, store: S) -> Result<Self> {
        Ok(Self::from_chain_state(ChainState::open(params, config, store)?))
    }

    pub fn from_chain_state(chain: ChainState<S>) -> Self {
        let mempool = Mempool::new(chain.config().mempool.clone());
        let events = EventBus::new(chain.config().chain.event_log_capacity);
        let snapshot = RwLock::new(Arc::new(snapshot_of(&chain)));
        Node { state: Mutex::new(NodeState { chain, mempool }), snapshot, events }
    }

    /// Latest committed chain view. Never waits for a running transition.
    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> Receiver<SequencedEvent> {
        self.events.subscribe()
    }

    pub fn replay_from(&self, after: u64) -> Option<Vec<SequencedEvent>> {
        self.events.replay_from(after)
    }

    /// Read access to the chain state under the writer lock.
    pub fn with_chain<R>(&self, f: impl FnOnce(&ChainState<S>) -> R) -> R {
        f(&self.state.lock().chain)
    }

    pub fn with_mempool<R>(&self, f: impl FnOnce(&Mempool) -> R) -> R {
        f(&self.state.lock().mempool)
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().chain.is_halted()
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    pub fn mempool_entry(&self, txid: &Hash) -> Option<MempoolEntry> {
        self.state.lock().mempool.get(txid).cloned()
    }

    pub fn pin_transaction(&self, txid: &Hash) -> bool {
        self.state.lock().mempool.pin(txid)
    }

    pub fn unpin_transaction(&self, txid: &Hash) -> bool {
        self.state.lock().mempool.unpin(txid)
    }

    pub fn accept_header(&self, header: &BlockHeader) -> Result<Hash> {
        self.state.lock().chain.accept_header(header)
    }

    /// Process a block and bring the mempool, snapshot and subscribers in
    /// line with whatever the active chain did.
    ///
    /// Tip moves committed before an error are published before the error
    /// is returned.
    pub fn process_block(&self, block: Block) -> Result<BlockResult> {
        let mut state = self.state.lock();
        match state.chain.process_block(block) {
            Ok(result) => {
                self.publish_updates(&mut state, &result.updates);
                Ok(result)
            }
            Err(e) => {
                let committed = state.chain.take_unreported_updates();
                self.publish_updates(&mut state, &committed);
                Err(e)
            }
        }
    }

    fn publish_updates(&self, state: &mut NodeState<S>, updates: &[TipUpdate]) {
        if updates.is_empty() {
            return;
        }
        let events = self.apply_updates(state, updates);
        *self.snapshot.write() = Arc::new(snapshot_of(&state.chain));
        self.events.publish_all(events);
    }

    /// Events in order: per tip move, disconnected blocks from the top down,
    /// connected blocks from the bottom up, then the tip change. Mempool
    /// events follow once all moves are reconciled.
    fn apply_updates(&self, state: &mut NodeState<S>, updates: &[TipUpdate]) -> Vec<ChainEvent> {
        let mut events = Vec::new();
        let mut returning: Vec<Transaction> = Vec::new();
        let mut evictions = Vec::new();

        for update in updates {
            for block in &update.disconnected {
                events.push(ChainEvent::BlockDisconnected {
                    hash: block.hash,
                    height: block.height,
                    block: block.block.clone(),
                    delta: Arc::new(block.delta()),
                });
            }
            // lowest disconnected block first
            for block in update.disconnected.iter().rev() {
                returning.extend(block.block.transactions.iter().filter(|tx| !tx.is_coinbase()).cloned());
            }
            for block in &update.connected {
                events.push(ChainEvent::BlockConnected {
                    hash: block.hash,
                    height: block.height,
                    block: block.block.clone(),
                    delta: Arc::new(block.delta()),
                });
                evictions.extend(state.mempool.remove_for_block(&block.block, &block.hash));
            }
            events.push(ChainEvent::ChainTipChanged {
                old_tip: update.old_tip,
                new_tip: update.new_tip,
                height: update.height,
            });
        }

        let ctx = state.mempool_context();
        let NodeState { chain, mempool } = state;
        if !returning.is_empty() {
            let admitted = mempool.reinsert(returning, chain.utxos(), &ctx, chain.params(), chain.script_checker());
            debug!("returned {} transaction(s) to the mempool", admitted.len());
            for admission in admitted {
                admission_events(admission, &mut events);
            }
        }
        evictions.extend(mempool.revalidate(chain.utxos(), &ctx, chain.params()));
        events.extend(evictions.into_iter().map(evicted_event));
        events
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<MempoolEntry> {
        let mut state = self.state.lock();
        state.chain_running()?;
        let admission = state.accept(tx, AcceptOptions::default())?;
        let mut events = Vec::new();
        let entry = admission_events(admission, &mut events);
        self.events.publish_all(events);
        Ok(entry)
    }

    /// Admit a batch in order. Scripts of inputs already confirmed are
    /// verified in parallel against the current snapshot before the writer
    /// lock is taken.
    pub fn submit_transactions(&self, txs: Vec<Transaction>) -> Vec<Result<MempoolEntry>> {
        let snapshot = self.snapshot();
        let (checker, flags) = {
            let state = self.state.lock();
            let chain = &state.chain;
            let flags = chain.params().script_flags(snapshot.height + 1) | STANDARD_SCRIPT_VERIFY_FLAGS;
            (chain.script_checker().clone(), flags)
        };

        // Some(verdict) when every input resolved against the snapshot
        let prechecked: Vec<Option<Result<()>>> = txs
            .par_iter()
            .map(|tx| match script_checks(tx, &*snapshot, flags) {
                Ok(checks) => Some(checker.verify_all(&checks)),
                Err(_) => None,
            })
            .collect();

        let mut state = self.state.lock();
        let mut events = Vec::new();
        let mut results = Vec::with_capacity(txs.len());
        for (tx, precheck) in txs.into_iter().zip(prechecked) {
            let result = match precheck {
                Some(Err(e)) => Err(e),
                verified => state.chain_running().and_then(|_| {
                    let options = AcceptOptions { scripts_verified: verified.is_some(), ..Default::default() };
                    state.accept(tx, options)
                }),
            };
            results.push(result.map(|admission| admission_events(admission, &mut events)));
        }
        drop(state);
        info!(
            "batch of {} transaction(s): {} accepted",
            results.len(),
            results.iter().filter(|r| r.is_ok()).count()
        );
        self.events.publish_all(events);
        results
    }
}

impl<S: ChainStore> NodeState<S> {
    fn chain_running(&self) -> Result<()> {
        if self.chain.is_halted() {
            return Err(ConsensusError::StorageFatal("node halted".to_string()));
        }
        Ok(())
    }
}

impl<S: ChainStore> std::fmt::Debug for Node<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Node")
            .field("tip", &hash_to_hex(&snapshot.tip))
            .field("height", &snapshot.height)
            .field("last_event", &self.events.last_sequence())
            .finish()
    }
}
