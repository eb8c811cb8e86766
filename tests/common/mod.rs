//! Regtest chain builder shared by the integration tests.
#![allow(dead_code)]

use consensus_chainstate::economic::get_block_subsidy;
use consensus_chainstate::pow::check_proof_of_work;
use consensus_chainstate::script::{p2sh_script, push_data, push_int, OP_1};
use consensus_chainstate::serialization::{block_hash, block_merkle_root, hash160, txid};
use consensus_chainstate::utxo::UtxoChanges;
use consensus_chainstate::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Locking script any push of `OP_1` satisfies, wrapped as P2SH so relay
/// policy accepts it.
pub fn anyone_can_spend() -> Vec<u8> {
    p2sh_script(&hash160(&[OP_1]))
}

pub fn unlock() -> Vec<u8> {
    let mut script = Vec::new();
    push_data(&mut script, &[OP_1]);
    script
}

pub fn coinbase(height: Height, tag: u8, value: Amount) -> Transaction {
    let mut script_sig = Vec::new();
    push_int(&mut script_sig, height as i64);
    push_data(&mut script_sig, &[tag, 0xcb]);
    Transaction {
        version: 1,
        inputs: vec![TransactionInput { prevout: OutPoint::null(), script_sig, sequence: u32::MAX }],
        outputs: vec![TransactionOutput { value, script_pubkey: anyone_can_spend() }],
        lock_time: 0,
    }
}

pub fn spend(prevouts: &[OutPoint], values: &[Amount]) -> Transaction {
    spend_with_sequence(prevouts, values, u32::MAX)
}

pub fn spend_with_sequence(prevouts: &[OutPoint], values: &[Amount], sequence: u32) -> Transaction {
    Transaction {
        version: 2,
        inputs: prevouts
            .iter()
            .map(|p| TransactionInput { prevout: p.clone(), script_sig: unlock(), sequence })
            .collect(),
        outputs: values
            .iter()
            .map(|v| TransactionOutput { value: *v, script_pubkey: anyone_can_spend() })
            .collect(),
        lock_time: 0,
    }
}

pub fn outpoint(tx: &Transaction, index: u32) -> OutPoint {
    OutPoint::new(txid(tx), index)
}

/// Recompute the merkle root and grind the nonce until the header meets
/// its own target.
pub fn seal(mut block: Block, params: &ChainParams) -> Block {
    if let Some((root, _)) = block_merkle_root(&block) {
        block.header.merkle_root = root;
    }
    while check_proof_of_work(&block.header, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// Tracks tips of built blocks so tests can extend any branch.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    pub params: ChainParams,
    pub genesis: Block,
}

#[derive(Debug, Clone)]
pub struct Built {
    pub block: Block,
    pub hash: Hash,
    pub height: Height,
}

impl Built {
    pub fn coinbase_outpoint(&self) -> OutPoint {
        outpoint(&self.block.transactions[0], 0)
    }
}

impl ChainBuilder {
    pub fn regtest() -> Self {
        let params = ChainParams::regtest();
        let genesis = params.genesis_block();
        ChainBuilder { params, genesis }
    }

    pub fn genesis(&self) -> Built {
        Built { block: self.genesis.clone(), hash: block_hash(&self.genesis.header), height: 0 }
    }

    /// Block on top of `parent` paying the full subsidy plus `fees`.
    pub fn block(&self, parent: &Built, tag: u8, txs: Vec<Transaction>, fees: Amount) -> Built {
        let height = parent.height + 1;
        let value = get_block_subsidy(height, &self.params) + fees;
        let mut transactions = vec![coinbase(height, tag, value)];
        transactions.extend(txs);
        self.block_with(parent, tag, transactions)
    }

    pub fn empty(&self, parent: &Built, tag: u8) -> Built {
        self.block(parent, tag, Vec::new(), 0)
    }

    /// Block on top of `parent` with exactly `transactions`, coinbase included.
    pub fn block_with(&self, parent: &Built, tag: u8, transactions: Vec<Transaction>) -> Built {
        let header = BlockHeader {
            version: 4,
            prev_block_hash: parent.hash,
            merkle_root: [0; 32],
            timestamp: parent.block.header.timestamp + 600 + tag as u32,
            bits: self.params.pow_limit_bits,
            nonce: 0,
        };
        let block = seal(Block { header, transactions }, &self.params);
        Built { hash: block_hash(&block.header), height: parent.height + 1, block }
    }

    /// `count` empty blocks on top of `parent`; returns them lowest first.
    pub fn extend(&self, parent: &Built, count: usize, tag: u8) -> Vec<Built> {
        let mut out: Vec<Built> = Vec::with_capacity(count);
        let mut tip = parent.clone();
        for _ in 0..count {
            let next = self.empty(&tip, tag);
            out.push(next.clone());
            tip = next;
        }
        out
    }
}

pub fn node() -> Node<MemoryStore> {
    Node::open(ChainParams::regtest(), NodeConfig::default(), MemoryStore::new()).expect("open node")
}

pub fn chain_state(store: MemoryStore) -> ChainState<MemoryStore> {
    let config = NodeConfig::default();
    let checker = ScriptChecker::standard(&config.scripts);
    open_chain(store, checker)
}

pub fn open_chain<S: ChainStore>(store: S, checker: ScriptChecker) -> ChainState<S> {
    ChainState::open_with(
        ChainParams::regtest(),
        NodeConfig::default(),
        store,
        checker,
        Arc::new(FixedClock::new(2_000_000_000)),
    )
    .expect("open chain state")
}

/// Accepts every script until switched to reject them all.
#[derive(Debug, Default)]
pub struct SwitchableVerifier {
    reject: AtomicBool,
}

impl SwitchableVerifier {
    pub fn reject_all(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

impl ScriptVerifier for SwitchableVerifier {
    fn verify(&self, _check: &ScriptCheck<'_>, _deadline: Instant) -> std::result::Result<bool, ScriptError> {
        Ok(!self.reject.load(Ordering::SeqCst))
    }
}

pub fn switchable_checker() -> (Arc<SwitchableVerifier>, ScriptChecker) {
    let verifier = Arc::new(SwitchableVerifier::default());
    let checker = ScriptChecker::new(verifier.clone(), &NodeConfig::default().scripts);
    (verifier, checker)
}

/// Memory store whose commit fails when it would move the tip to `fail_at`.
#[derive(Debug)]
pub struct FailingTipStore {
    pub inner: MemoryStore,
    fail_at: Hash,
    staged_tip: Option<Hash>,
}

impl FailingTipStore {
    pub fn new(fail_at: Hash) -> Self {
        FailingTipStore { inner: MemoryStore::new(), fail_at, staged_tip: None }
    }
}

impl ChainStore for FailingTipStore {
    fn store_block(&mut self, hash: &Hash, block: &Block) -> Result<()> {
        self.inner.store_block(hash, block)
    }

    fn load_block(&self, hash: &Hash) -> Result<Option<Block>> {
        self.inner.load_block(hash)
    }

    fn has_block(&self, hash: &Hash) -> Result<bool> {
        self.inner.has_block(hash)
    }

    fn put_index_entry(&mut self, node: &ChainNode) -> Result<()> {
        self.inner.put_index_entry(node)
    }

    fn load_index(&self) -> Result<Vec<ChainNode>> {
        self.inner.load_index()
    }

    fn load_undo(&self, hash: &Hash) -> Result<Option<BlockUndo>> {
        self.inner.load_undo(hash)
    }

    fn load_tip(&self) -> Result<Option<Hash>> {
        self.inner.load_tip()
    }

    fn load_utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        self.inner.load_utxos()
    }

    fn begin_apply(&mut self) -> Result<()> {
        self.staged_tip = None;
        self.inner.begin_apply()
    }

    fn stage_utxo_changes(&mut self, changes: &UtxoChanges) -> Result<()> {
        self.inner.stage_utxo_changes(changes)
    }

    fn stage_undo(&mut self, hash: &Hash, undo: &BlockUndo) -> Result<()> {
        self.inner.stage_undo(hash, undo)
    }

    fn stage_remove_undo(&mut self, hash: &Hash) -> Result<()> {
        self.inner.stage_remove_undo(hash)
    }

    fn stage_tip(&mut self, tip: &Hash) -> Result<()> {
        self.staged_tip = Some(*tip);
        self.inner.stage_tip(tip)
    }

    fn commit(&mut self) -> Result<()> {
        if self.staged_tip.take() == Some(self.fail_at) {
            self.inner.abort();
            return Err(ConsensusError::StorageFatal("disk full".to_string()));
        }
        self.inner.commit()
    }

    fn abort(&mut self) {
        self.staged_tip = None;
        self.inner.abort();
    }
}

/// Drain every event currently queued on `rx`.
pub fn drain(rx: &std::sync::mpsc::Receiver<SequencedEvent>) -> Vec<SequencedEvent> {
    rx.try_iter().collect()
}
