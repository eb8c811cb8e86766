//! Pool of unconfirmed transactions: admission policy, fee-bump replacement,
//! size limits and reconciliation with chain changes.

use crate::config::MempoolPolicy;
use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::events::EvictionReason;
use crate::params::ChainParams;
use crate::script::{is_push_only, is_unspendable, ScriptKind};
use crate::script_check::ScriptChecker;
use crate::serialization::{hash_to_hex, transaction_size, txid};
use crate::transaction::{check_transaction, check_tx_inputs, is_final_tx, script_checks};
use crate::types::*;
use crate::utxo::UtxoView;
use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Hash,
    pub fee: Amount,
    pub size: usize,
    pub fee_rate: FeeRate,
    /// Chain height when the entry was admitted
    pub entry_height: Height,
    /// Admission order
    pub sequence: u64,
}

impl MempoolEntry {
    /// Whether any input opts in to replacement.
    pub fn signals_replacement(&self) -> bool {
        signals_replacement(&self.tx)
    }
}

pub fn signals_replacement(tx: &Transaction) -> bool {
    tx.inputs.iter().any(|i| i.sequence <= SEQUENCE_REPLACEABLE_MAX)
}

/// Chain facts admission depends on, taken at the current tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolContext {
    /// Height of the next block
    pub spend_height: Height,
    pub median_time_past: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptOptions {
    /// Skip the minimum relay fee (transactions returning from disconnected blocks)
    pub bypass_fee_floor: bool,
    /// Scripts were already verified against the same prevouts
    pub scripts_verified: bool,
    pub allow_replacement: bool,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        AcceptOptions { bypass_fee_floor: false, scripts_verified: false, allow_replacement: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub entry: MempoolEntry,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub entry: MempoolEntry,
    pub evicted: Vec<Eviction>,
}

/// UTXO view that layers mempool outputs over a chain view.
pub struct MempoolView<'a, V: UtxoView + ?Sized> {
    chain: &'a V,
    pool: &'a Mempool,
    height: Height,
    excluded: Option<&'a HashSet<Hash>>,
}

impl<'a, V: UtxoView + ?Sized> MempoolView<'a, V> {
    pub fn new(chain: &'a V, pool: &'a Mempool, height: Height) -> Self {
        MempoolView { chain, pool, height, excluded: None }
    }
}

impl<V: UtxoView + ?Sized> UtxoView for MempoolView<'_, V> {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        match self.pool.entries.get(&outpoint.hash) {
            Some(entry) => {
                if self.excluded.map_or(false, |ex| ex.contains(&outpoint.hash)) {
                    return None;
                }
                entry
                    .tx
                    .outputs
                    .get(outpoint.index as usize)
                    .filter(|o| !is_unspendable(&o.script_pubkey))
                    .map(|o| UtxoEntry {
                        value: o.value,
                        script_pubkey: o.script_pubkey.clone(),
                        height: self.height,
                        is_coinbase: false,
                    })
            }
            None => self.chain.get_utxo(outpoint),
        }
    }
}

/// IsStandardTx: relay policy on top of consensus.
///
/// 1. Version is 1 or 2
/// 2. Serialized size ≤ `max_standard_tx_size`
/// 3. Unlocking scripts are push-only and ≤ `max_script_sig_size`
/// 4. Outputs match a standard template; at most one null-data output,
///    ≤ `max_null_data_size` bytes
/// 5. Spendable outputs carry at least `dust_limit`
pub fn is_standard_tx(tx: &Transaction, policy: &MempoolPolicy) -> Result<()> {
    let reject = |reason: String| Err(ConsensusError::PolicyRejected(reason));

    if !(1..=2).contains(&tx.version) {
        return reject(format!("version {} not standard", tx.version));
    }
    let size = transaction_size(tx);
    if size > policy.max_standard_tx_size {
        return reject(format!("size {} exceeds standard limit", size));
    }
    for (i, input) in tx.inputs.iter().enumerate() {
        if input.script_sig.len() > policy.max_script_sig_size {
            return reject(format!("input {} unlocking script too large", i));
        }
        if !is_push_only(&input.script_sig) {
            return reject(format!("input {} unlocking script not push-only", i));
        }
    }

    let mut null_data = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        match ScriptKind::classify(&output.script_pubkey) {
            ScriptKind::NonStandard => return reject(format!("output {} script not standard", i)),
            ScriptKind::NullData => {
                null_data += 1;
                if output.script_pubkey.len() > policy.max_null_data_size {
                    return reject(format!("output {} null data too large", i));
                }
            }
            _ if output.value < policy.dust_limit => {
                return reject(format!("output {} value {} is dust", i, output.value));
            }
            _ => {}
        }
    }
    if null_data > 1 {
        return reject("more than one null-data output".to_string());
    }
    Ok(())
}

/// ReplacementChecks: may `tx` (paying `fee` for `size` bytes) evict
/// `evicted`, of which `conflicts` are the entries it directly conflicts with?
///
/// 1. Every direct conflict signals replaceability (when required)
/// 2. No more than `max_replacement_evictions` entries are evicted
/// 3. New fee rate ≥ highest evicted fee rate + incremental relay rate
/// 4. New fee ≥ total evicted fees + incremental relay fee for `size`
pub fn replacement_checks(
    fee: Amount,
    size: usize,
    conflicts: &[&MempoolEntry],
    evicted: &[&MempoolEntry],
    policy: &MempoolPolicy,
) -> Result<()> {
    if policy.require_replacement_signal {
        if let Some(unsignalled) = conflicts.iter().find(|e| !e.signals_replacement()) {
            return Err(ConsensusError::PolicyRejected(format!(
                "conflicting transaction {} does not signal replaceability",
                hash_to_hex(&unsignalled.txid)
            )));
        }
    }
    if evicted.len() > policy.max_replacement_evictions {
        return Err(ConsensusError::PolicyRejected(format!(
            "replacement would evict {} transactions",
            evicted.len()
        )));
    }

    let fee_rate = FeeRate::from_fee_and_size(fee, size);
    let highest = evicted.iter().map(|e| e.fee_rate).max().unwrap_or_default();
    let required_rate = FeeRate(highest.0.saturating_add(policy.incremental_relay_fee_rate));
    if fee_rate < required_rate {
        return Err(ConsensusError::PolicyRejected(format!(
            "replacement fee rate {} below required {}",
            fee_rate, required_rate
        )));
    }

    let evicted_fees: Amount = evicted.iter().map(|e| e.fee).sum();
    let required_fee = evicted_fees + FeeRate(policy.incremental_relay_fee_rate).fee_for(size);
    if fee < required_fee {
        return Err(ConsensusError::PolicyRejected(format!(
            "replacement fee {} below required {}",
            fee, required_fee
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    policy: MempoolPolicy,
    entries: HashMap<Hash, MempoolEntry>,
    /// Outpoint → mempool transaction spending it
    spenders: HashMap<OutPoint, Hash>,
    total_bytes: usize,
    pinned: HashSet<Hash>,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(policy: MempoolPolicy) -> Self {
        Mempool { policy, ..Default::default() }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&Hash> {
        self.spenders.get(outpoint)
    }

    /// Entries in admission order.
    pub fn entries(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Protect an entry from eviction for space. Returns false if absent.
    pub fn pin(&mut self, txid: &Hash) -> bool {
        self.entries.contains_key(txid) && self.pinned.insert(*txid)
    }

    pub fn unpin(&mut self, txid: &Hash) -> bool {
        self.pinned.remove(txid)
    }

    pub fn is_pinned(&self, txid: &Hash) -> bool {
        self.pinned.contains(txid)
    }

    /// `roots` followed by every in-pool transaction spending from them,
    /// transitively, parents before children.
    pub fn with_descendants(&self, roots: &[Hash]) -> Vec<Hash> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<Hash> = roots.iter().copied().collect();
        while let Some(h) = queue.pop_front() {
            let Some(entry) = self.entries.get(&h) else {
                continue;
            };
            if !seen.insert(h) {
                continue;
            }
            out.push(h);
            for index in 0..entry.tx.outputs.len() {
                if let Some(child) = self.spenders.get(&OutPoint::new(h, index as u32)) {
                    queue.push_back(*child);
                }
            }
        }
        out
    }

    fn remove_entry(&mut self, txid: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            if self.spenders.get(&input.prevout) == Some(txid) {
                self.spenders.remove(&input.prevout);
            }
        }
        self.total_bytes -= entry.size;
        self.pinned.remove(txid);
        Some(entry)
    }

    fn remove_all(&mut self, hashes: &[Hash], reason: EvictionReason) -> Vec<Eviction> {
        let evicted: Vec<Eviction> = hashes
            .iter()
            .filter_map(|h| self.remove_entry(h))
            .map(|entry| Eviction { entry, reason })
            .collect();
        for e in &evicted {
            debug!("evicted {} from mempool: {}", hash_to_hex(&e.entry.txid), reason);
        }
        evicted
    }

    /// Lowest fee-rate packages (entry plus descendants) that make room for
    /// `size` more bytes, never touching pinned entries, entries already
    /// leaving, or parents of the newcomer.
    fn select_for_space(
        &self,
        size: usize,
        fee_rate: FeeRate,
        leaving: &HashSet<Hash>,
        parents: &HashSet<Hash>,
    ) -> Result<Vec<Hash>> {
        let leaving_bytes: usize = leaving.iter().filter_map(|h| self.entries.get(h)).map(|e| e.size).sum();
        let mut count = self.entries.len() - leaving.len() + 1;
        let mut bytes = self.total_bytes - leaving_bytes + size;
        let fits = |count: usize, bytes: usize| count <= self.policy.max_transactions && bytes <= self.policy.max_bytes;
        if fits(count, bytes) {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<&MempoolEntry> = self
            .entries
            .values()
            .filter(|e| !leaving.contains(&e.txid) && !self.pinned.contains(&e.txid))
            .collect();
        candidates.sort_by(|a, b| a.fee_rate.cmp(&b.fee_rate).then(b.sequence.cmp(&a.sequence)));

        let mut chosen: HashSet<Hash> = HashSet::new();
        let mut victims = Vec::new();
        for candidate in candidates {
            if candidate.fee_rate >= fee_rate {
                break;
            }
            if chosen.contains(&candidate.txid) {
                continue;
            }
            let package = self.with_descendants(&[candidate.txid]);
            if package
                .iter()
                .any(|h| self.pinned.contains(h) || parents.contains(h) || leaving.contains(h))
            {
                continue;
            }
            for h in package {
                if chosen.insert(h) {
                    if let Some(e) = self.entries.get(&h) {
                        count -= 1;
                        bytes -= e.size;
                    }
                    victims.push(h);
                }
            }
            if fits(count, bytes) {
                return Ok(victims);
            }
        }
        Err(ConsensusError::ResourceExhausted(format!(
            "mempool full: {} transactions, {} bytes",
            self.entries.len(),
            self.total_bytes
        )))
    }

    /// AcceptToMemoryPool
    ///
    /// 1. Not a coinbase, not already pooled, not already confirmed
    /// 2. Context-free consensus checks, standardness, finality at the next block
    /// 3. Conflicts resolved by replacement or rejected
    /// 4. Inputs exist in chain or pool; fee ≥ relay floor
    /// 5. Scripts verify
    /// 6. Room is made by evicting lower fee-rate packages, or the
    ///    transaction is rejected
    pub fn accept<V: UtxoView + ?Sized>(
        &mut self,
        tx: Transaction,
        chain: &V,
        ctx: &MempoolContext,
        params: &ChainParams,
        checker: &ScriptChecker,
        options: AcceptOptions,
    ) -> Result<Admission> {
        if tx.is_coinbase() {
            return Err(ConsensusError::ConsensusInvalid("coinbase transaction outside a block".to_string()));
        }
        let id = txid(&tx);
        if self.entries.contains_key(&id) {
            return Err(ConsensusError::PolicyRejected(format!("{} already in mempool", hash_to_hex(&id))));
        }
        check_transaction(&tx, params)?;
        is_standard_tx(&tx, &self.policy)?;
        if !is_final_tx(&tx, ctx.spend_height, ctx.median_time_past as u64) {
            return Err(ConsensusError::PolicyRejected("transaction is not final".to_string()));
        }
        if (0..tx.outputs.len()).any(|i| chain.contains_utxo(&OutPoint::new(id, i as u32))) {
            return Err(ConsensusError::PolicyRejected(format!("{} already confirmed", hash_to_hex(&id))));
        }

        let mut conflicts = Vec::new();
        for input in &tx.inputs {
            if let Some(spender) = self.spenders.get(&input.prevout) {
                if !conflicts.contains(spender) {
                    conflicts.push(*spender);
                }
            }
        }
        let evicting = if conflicts.is_empty() {
            Vec::new()
        } else if self.policy.enable_replacement && options.allow_replacement {
            self.with_descendants(&conflicts)
        } else {
            return Err(ConsensusError::PolicyRejected(format!(
                "conflicts with mempool transaction {}",
                hash_to_hex(&conflicts[0])
            )));
        };
        let leaving: HashSet<Hash> = evicting.iter().copied().collect();
        if tx.inputs.iter().any(|i| leaving.contains(&i.prevout.hash)) {
            return Err(ConsensusError::PolicyRejected(
                "replacement spends an output of a transaction it replaces".to_string(),
            ));
        }

        let view = MempoolView { chain, pool: &*self, height: ctx.spend_height, excluded: Some(&leaving) };
        let fee = check_tx_inputs(&tx, &view, ctx.spend_height, params)?;
        let size = transaction_size(&tx);
        let fee_rate = FeeRate::from_fee_and_size(fee, size);
        if !options.bypass_fee_floor && fee_rate < FeeRate(self.policy.min_relay_fee_rate) {
            return Err(ConsensusError::PolicyRejected(format!(
                "fee rate {} below relay minimum {}",
                fee_rate, self.policy.min_relay_fee_rate
            )));
        }

        if !evicting.is_empty() {
            let direct: Vec<&MempoolEntry> = conflicts.iter().filter_map(|h| self.entries.get(h)).collect();
            let all: Vec<&MempoolEntry> = evicting.iter().filter_map(|h| self.entries.get(h)).collect();
            replacement_checks(fee, size, &direct, &all, &self.policy)?;
        }

        if !options.scripts_verified {
            checker.verify_all(&script_checks(&tx, &view, ctx.flags)?)?;
        }

        let parents: HashSet<Hash> = tx
            .inputs
            .iter()
            .map(|i| i.prevout.hash)
            .filter(|h| self.entries.contains_key(h))
            .collect();
        let victims = self.select_for_space(size, fee_rate, &leaving, &parents)?;

        let mut evicted = self.remove_all(&evicting, EvictionReason::Replaced { by: id });
        evicted.extend(self.remove_all(&victims, EvictionReason::SizeLimit));

        let entry = MempoolEntry {
            tx: Arc::new(tx),
            txid: id,
            fee,
            size,
            fee_rate,
            entry_height: ctx.spend_height.saturating_sub(1),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        for input in &entry.tx.inputs {
            self.spenders.insert(input.prevout.clone(), id);
        }
        self.total_bytes += size;
        self.entries.insert(id, entry.clone());
        debug!("accepted {} to mempool at {} ({} evicted)", hash_to_hex(&id), fee_rate, evicted.len());
        Ok(Admission { entry, evicted })
    }

    /// Drop transactions confirmed by `block` without signalling them, then
    /// evict whatever still spends an outpoint the block consumed.
    pub fn remove_for_block(&mut self, block: &Block, block_hash: &Hash) -> Vec<Eviction> {
        let spending: Vec<&Transaction> = block.transactions.iter().filter(|tx| !tx.is_coinbase()).collect();
        for tx in &spending {
            self.remove_entry(&txid(tx));
        }

        let mut conflicting = Vec::new();
        for tx in &spending {
            for input in &tx.inputs {
                if let Some(spender) = self.spenders.get(&input.prevout) {
                    conflicting.push(*spender);
                }
            }
        }
        let doomed = self.with_descendants(&conflicting);
        self.remove_all(&doomed, EvictionReason::Conflict { block: *block_hash })
    }

    /// Offer transactions from disconnected blocks back to the pool, oldest
    /// first. Fee floors do not apply; anything else failing is dropped.
    pub fn reinsert<V: UtxoView + ?Sized>(
        &mut self,
        txs: Vec<Transaction>,
        chain: &V,
        ctx: &MempoolContext,
        params: &ChainParams,
        checker: &ScriptChecker,
    ) -> Vec<Admission> {
        let options = AcceptOptions { bypass_fee_floor: true, scripts_verified: false, allow_replacement: false };
        let mut admitted = Vec::new();
        for tx in txs.into_iter().filter(|tx| !tx.is_coinbase()) {
            let id = txid(&tx);
            match self.accept(tx, chain, ctx, params, checker, options) {
                Ok(admission) => admitted.push(admission),
                Err(e) => debug!("dropped disconnected transaction {}: {}", hash_to_hex(&id), e),
            }
        }
        admitted
    }

    /// Re-check every entry's inputs, maturity and finality against the
    /// current chain; failures leave with their descendants.
    pub fn revalidate<V: UtxoView + ?Sized>(
        &mut self,
        chain: &V,
        ctx: &MempoolContext,
        params: &ChainParams,
    ) -> Vec<Eviction> {
        let failing: Vec<Hash> = {
            let view = MempoolView::new(chain, self, ctx.spend_height);
            self.entries()
                .into_iter()
                .filter(|e| {
                    !is_final_tx(&e.tx, ctx.spend_height, ctx.median_time_past as u64)
                        || check_tx_inputs(&e.tx, &view, ctx.spend_height, params).is_err()
                })
                .map(|e| e.txid)
                .collect()
        };
        if !failing.is_empty() {
            warn!("{} mempool transaction(s) no longer valid", failing.len());
        }
        let doomed = self.with_descendants(&failing);
        self.remove_all(&doomed, EvictionReason::Reorg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptConfig;
    use crate::script::{p2sh_script, push_data, OP_1, OP_DUP, OP_RETURN};
    use crate::serialization::hash160;
    use crate::utxo::{UtxoMut, UtxoSet};

    fn anyone_can_spend() -> Vec<u8> {
        p2sh_script(&hash160(&[OP_1]))
    }

    fn unlock() -> Vec<u8> {
        let mut script = Vec::new();
        push_data(&mut script, &[OP_1]);
        script
    }

    fn spend(prevouts: &[OutPoint], values: &[Amount], sequence: u32) -> Transaction {
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

    struct Fixture {
        chain: UtxoSet,
        params: ChainParams,
        checker: ScriptChecker,
        ctx: MempoolContext,
        coins: Vec<OutPoint>,
    }

    fn fixture(n: usize) -> Fixture {
        let mut chain = UtxoSet::new();
        let coins: Vec<OutPoint> = (0..n).map(|i| OutPoint::new([i as u8 + 1; 32], 0)).collect();
        for coin in &coins {
            chain.add_utxo(
                coin.clone(),
                UtxoEntry { value: 100_000, script_pubkey: anyone_can_spend(), height: 1, is_coinbase: false },
            );
        }
        Fixture {
            chain,
            params: ChainParams::regtest(),
            checker: ScriptChecker::standard(&ScriptConfig::default()),
            ctx: MempoolContext { spend_height: 10, median_time_past: 0, flags: STANDARD_SCRIPT_VERIFY_FLAGS },
            coins,
        }
    }

    fn accept(pool: &mut Mempool, f: &Fixture, tx: Transaction) -> Result<Admission> {
        pool.accept(tx, &f.chain, &f.ctx, &f.params, &f.checker, AcceptOptions::default())
    }

    #[test]
    fn test_standardness() {
        let policy = MempoolPolicy::default();
        let f = fixture(1);
        assert!(is_standard_tx(&spend(&f.coins, &[50_000], u32::MAX), &policy).is_ok());

        let dust = spend(&f.coins, &[100], u32::MAX);
        assert!(is_standard_tx(&dust, &policy).is_err());

        let mut bare = spend(&f.coins, &[50_000], u32::MAX);
        bare.outputs[0].script_pubkey = vec![OP_1];
        assert!(is_standard_tx(&bare, &policy).is_err());

        let mut not_push = spend(&f.coins, &[50_000], u32::MAX);
        not_push.inputs[0].script_sig = vec![OP_DUP];
        assert!(is_standard_tx(&not_push, &policy).is_err());

        let mut memo = spend(&f.coins, &[50_000], u32::MAX);
        memo.outputs.push(TransactionOutput { value: 0, script_pubkey: vec![OP_RETURN, 0x01, 0x07] });
        assert!(is_standard_tx(&memo, &policy).is_ok());
        memo.outputs.push(TransactionOutput { value: 0, script_pubkey: vec![OP_RETURN, 0x01, 0x08] });
        assert!(is_standard_tx(&memo, &policy).is_err());
    }

    #[test]
    fn test_accept_and_chained_spend() {
        let f = fixture(1);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let parent = spend(&f.coins, &[90_000], u32::MAX);
        let parent_id = txid(&parent);
        let admitted = accept(&mut pool, &f, parent).unwrap();
        assert_eq!(admitted.entry.fee, 10_000);
        assert!(admitted.evicted.is_empty());

        let child = spend(&[OutPoint::new(parent_id, 0)], &[80_000], u32::MAX);
        accept(&mut pool, &f, child.clone()).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.with_descendants(&[parent_id]).len(), 2);

        let err = accept(&mut pool, &f, child).unwrap_err();
        assert_eq!(err.kind(), crate::error::RejectKind::PolicyRejected);
    }

    #[test]
    fn test_missing_inputs_not_yet_connectable() {
        let f = fixture(1);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let tx = spend(&[OutPoint::new([0xee; 32], 0)], &[1_000], u32::MAX);
        let err = accept(&mut pool, &f, tx).unwrap_err();
        assert_eq!(err.kind(), crate::error::RejectKind::NotYetConnectable);
    }

    #[test]
    fn test_relay_fee_floor() {
        let f = fixture(1);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let cheap = spend(&f.coins, &[99_999], u32::MAX);
        assert!(accept(&mut pool, &f, cheap.clone()).is_err());

        let options = AcceptOptions { bypass_fee_floor: true, ..Default::default() };
        assert!(pool.accept(cheap, &f.chain, &f.ctx, &f.params, &f.checker, options).is_ok());
    }

    #[test]
    fn test_replacement_rules() {
        let f = fixture(1);
        let mut pool = Mempool::new(MempoolPolicy::default());

        let final_tx = spend(&f.coins, &[99_000], u32::MAX);
        accept(&mut pool, &f, final_tx).unwrap();
        let bump = spend(&f.coins, &[90_000], SEQUENCE_REPLACEABLE_MAX);
        assert!(accept(&mut pool, &f, bump).is_err(), "original did not signal");

        let mut pool = Mempool::new(MempoolPolicy::default());
        let original = spend(&f.coins, &[99_000], SEQUENCE_REPLACEABLE_MAX);
        let original_id = txid(&original);
        accept(&mut pool, &f, original).unwrap();

        let stingy = spend(&f.coins, &[98_990], SEQUENCE_REPLACEABLE_MAX);
        assert!(accept(&mut pool, &f, stingy).is_err());

        let generous = spend(&f.coins, &[95_000], SEQUENCE_REPLACEABLE_MAX);
        let generous_id = txid(&generous);
        let admitted = accept(&mut pool, &f, generous).unwrap();
        assert_eq!(admitted.evicted.len(), 1);
        assert_eq!(admitted.evicted[0].entry.txid, original_id);
        assert_eq!(admitted.evicted[0].reason, EvictionReason::Replaced { by: generous_id });
        assert!(!pool.contains(&original_id));
        assert_eq!(pool.spender_of(&f.coins[0]), Some(&generous_id));
    }

    #[test]
    fn test_replacement_cannot_spend_what_it_evicts() {
        let f = fixture(2);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let original = spend(&f.coins[..1], &[99_000], SEQUENCE_REPLACEABLE_MAX);
        let original_id = txid(&original);
        accept(&mut pool, &f, original).unwrap();

        let sneaky = spend(&[f.coins[0].clone(), OutPoint::new(original_id, 0)], &[50_000], SEQUENCE_REPLACEABLE_MAX);
        assert!(accept(&mut pool, &f, sneaky).is_err());
        assert!(pool.contains(&original_id));
    }

    #[test]
    fn test_space_eviction_respects_fee_rate_and_pins() {
        let f = fixture(3);
        let policy = MempoolPolicy { max_transactions: 2, ..Default::default() };
        let mut pool = Mempool::new(policy);

        let low = spend(&f.coins[..1], &[99_000], u32::MAX);
        let mid = spend(&f.coins[1..2], &[98_000], u32::MAX);
        let low_id = txid(&low);
        accept(&mut pool, &f, low).unwrap();
        accept(&mut pool, &f, mid).unwrap();

        let high = spend(&f.coins[2..3], &[90_000], u32::MAX);
        let admitted = accept(&mut pool, &f, high.clone()).unwrap();
        assert_eq!(admitted.evicted.len(), 1);
        assert_eq!(admitted.evicted[0].entry.txid, low_id);
        assert_eq!(admitted.evicted[0].reason, EvictionReason::SizeLimit);
        assert_eq!(pool.len(), 2);

        // everything left is pinned: a newcomer cannot make room
        let mut pool = Mempool::new(MempoolPolicy { max_transactions: 1, ..Default::default() });
        let low = spend(&f.coins[..1], &[99_000], u32::MAX);
        let low_id = txid(&low);
        accept(&mut pool, &f, low).unwrap();
        assert!(pool.pin(&low_id));
        let err = accept(&mut pool, &f, high).unwrap_err();
        assert_eq!(err.kind(), crate::error::RejectKind::ResourceExhausted);
        assert!(pool.contains(&low_id));
    }

    #[test]
    fn test_block_removal_and_conflicts() {
        let f = fixture(2);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let confirmed = spend(&f.coins[..1], &[90_000], u32::MAX);
        let conflicted = spend(&f.coins[1..2], &[90_000], u32::MAX);
        let conflicted_id = txid(&conflicted);
        accept(&mut pool, &f, confirmed.clone()).unwrap();
        accept(&mut pool, &f, conflicted).unwrap();
        let child = spend(&[OutPoint::new(conflicted_id, 0)], &[80_000], u32::MAX);
        accept(&mut pool, &f, child).unwrap();

        let double_spend = spend(&f.coins[1..2], &[10_000], u32::MAX);
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [0; 32],
                merkle_root: [0; 32],
                timestamp: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![confirmed, double_spend],
        };
        let evicted = pool.remove_for_block(&block, &[0xab; 32]);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|e| e.reason == EvictionReason::Conflict { block: [0xab; 32] }));
        assert!(pool.is_empty());
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    fn test_revalidate_drops_orphaned_entries() {
        let mut f = fixture(2);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let parent = spend(&f.coins[..1], &[90_000], u32::MAX);
        let parent_id = txid(&parent);
        accept(&mut pool, &f, parent).unwrap();
        accept(&mut pool, &f, spend(&[OutPoint::new(parent_id, 0)], &[80_000], u32::MAX)).unwrap();
        accept(&mut pool, &f, spend(&f.coins[1..2], &[90_000], u32::MAX)).unwrap();

        f.chain.spend_utxo(&f.coins[0]);
        let evicted = pool.revalidate(&f.chain, &f.ctx, &f.params);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|e| e.reason == EvictionReason::Reorg));
        assert_eq!(pool.len(), 1);
    }
}
