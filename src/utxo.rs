//! The unspent-output set, copy-on-write overlays over it, and block
//! apply/undo.

use crate::error::{ConsensusError, Result};
use crate::script::is_unspendable;
use crate::serialization::{encode_varint, sha256d, txid};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Read access to a set of unspent outputs.
pub trait UtxoView {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    fn contains_utxo(&self, outpoint: &OutPoint) -> bool {
        self.get_utxo(outpoint).is_some()
    }
}

/// Write access used by block apply/undo.
pub trait UtxoMut: UtxoView {
    fn add_utxo(&mut self, outpoint: OutPoint, entry: UtxoEntry);
    fn spend_utxo(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry>;
}

/// What connecting does with a created output whose outpoint is still
/// unspent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateOutputs {
    #[default]
    Reject,
    /// Replace the older entry; it is not restored on disconnect
    Overwrite,
}

/// Pending modifications: `Some` inserts or replaces, `None` removes.
pub type UtxoChanges = HashMap<OutPoint, Option<UtxoEntry>>;

/// Committed UTXO set. Cloning is cheap and yields a frozen snapshot; the
/// first write after a clone copies the map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    map: Arc<HashMap<OutPoint, UtxoEntry>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (OutPoint, UtxoEntry)>) -> Self {
        UtxoSet { map: Arc::new(entries.into_iter().collect()) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.map.iter()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.map.get(outpoint)
    }

    /// Frozen copy for concurrent readers.
    pub fn snapshot(&self) -> UtxoSet {
        self.clone()
    }

    /// Total value of all unspent outputs.
    pub fn total_value(&self) -> Amount {
        self.map.values().map(|e| e.value).sum()
    }

    /// Double SHA-256 over every entry in outpoint order. Two sets are
    /// byte-identical exactly when their digests match.
    pub fn digest(&self) -> Hash {
        let mut entries: Vec<_> = self.map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut bytes = Vec::with_capacity(entries.len() * 64);
        for (outpoint, entry) in entries {
            bytes.extend_from_slice(&outpoint.hash);
            bytes.extend_from_slice(&outpoint.index.to_le_bytes());
            bytes.extend_from_slice(&entry.value.to_le_bytes());
            bytes.extend_from_slice(&entry.height.to_le_bytes());
            bytes.push(entry.is_coinbase as u8);
            encode_varint(&mut bytes, entry.script_pubkey.len() as u64);
            bytes.extend_from_slice(&entry.script_pubkey);
        }
        sha256d(&bytes)
    }

    pub fn apply_changes(&mut self, changes: UtxoChanges) {
        if changes.is_empty() {
            return;
        }
        let map = Arc::make_mut(&mut self.map);
        for (outpoint, change) in changes {
            match change {
                Some(entry) => {
                    map.insert(outpoint, entry);
                }
                None => {
                    map.remove(&outpoint);
                }
            }
        }
    }

    /// Apply a block all-or-nothing and return its undo data.
    pub fn apply_block(&mut self, block: &Block, height: Height) -> Result<BlockUndo> {
        let (undo, changes) = {
            let mut overlay = UtxoOverlay::new(&*self);
            let undo = apply_block(&mut overlay, block, height, DuplicateOutputs::Reject)?;
            (undo, overlay.into_changes())
        };
        self.apply_changes(changes);
        Ok(undo)
    }

    /// Reverse `apply_block` all-or-nothing.
    pub fn undo_block(&mut self, block: &Block, undo: &BlockUndo) -> Result<()> {
        let changes = {
            let mut overlay = UtxoOverlay::new(&*self);
            undo_block(&mut overlay, block, undo)?;
            overlay.into_changes()
        };
        self.apply_changes(changes);
        Ok(())
    }
}

impl UtxoView for UtxoSet {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.map.get(outpoint).cloned()
    }

    fn contains_utxo(&self, outpoint: &OutPoint) -> bool {
        self.map.contains_key(outpoint)
    }
}

impl UtxoMut for UtxoSet {
    fn add_utxo(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        Arc::make_mut(&mut self.map).insert(outpoint, entry);
    }

    fn spend_utxo(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        if !self.map.contains_key(outpoint) {
            return None;
        }
        Arc::make_mut(&mut self.map).remove(outpoint)
    }
}

/// Uncommitted layer over another view. Dropping it discards every change.
pub struct UtxoOverlay<'a, V: UtxoView + ?Sized> {
    base: &'a V,
    changes: UtxoChanges,
}

impl<'a, V: UtxoView + ?Sized> UtxoOverlay<'a, V> {
    pub fn new(base: &'a V) -> Self {
        UtxoOverlay { base, changes: HashMap::new() }
    }

    /// Overlay that starts with `changes` already applied over `base`.
    pub fn with_changes(base: &'a V, changes: UtxoChanges) -> Self {
        UtxoOverlay { base, changes }
    }

    pub fn changes(&self) -> &UtxoChanges {
        &self.changes
    }

    pub fn into_changes(self) -> UtxoChanges {
        self.changes
    }
}

impl<V: UtxoView + ?Sized> UtxoView for UtxoOverlay<'_, V> {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        match self.changes.get(outpoint) {
            Some(change) => change.clone(),
            None => self.base.get_utxo(outpoint),
        }
    }
}

impl<V: UtxoView + ?Sized> UtxoMut for UtxoOverlay<'_, V> {
    fn add_utxo(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.changes.insert(outpoint, Some(entry));
    }

    fn spend_utxo(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let existing = self.get_utxo(outpoint)?;
        self.changes.insert(outpoint.clone(), None);
        Some(existing)
    }
}

/// Spend a transaction's inputs and create its outputs.
pub fn apply_transaction<V: UtxoMut + ?Sized>(
    view: &mut V,
    tx: &Transaction,
    height: Height,
    duplicates: DuplicateOutputs,
) -> Result<TxUndo> {
    let mut undo = TxUndo::default();
    let coinbase = tx.is_coinbase();
    if !coinbase {
        for input in &tx.inputs {
            let entry = view.spend_utxo(&input.prevout).ok_or_else(|| {
                ConsensusError::ConsensusInvalid(format!(
                    "input {}:{} missing or already spent",
                    hex::encode(input.prevout.hash),
                    input.prevout.index
                ))
            })?;
            undo.spent.push((input.prevout.clone(), entry));
        }
    }

    let id = txid(tx);
    for (index, output) in tx.outputs.iter().enumerate() {
        if is_unspendable(&output.script_pubkey) {
            continue;
        }
        let outpoint = OutPoint::new(id, index as u32);
        if duplicates == DuplicateOutputs::Reject && view.contains_utxo(&outpoint) {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "output {}:{} would overwrite an unspent output",
                hex::encode(id),
                index
            )));
        }
        view.add_utxo(
            outpoint,
            UtxoEntry {
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                height,
                is_coinbase: coinbase,
            },
        );
    }
    Ok(undo)
}

/// ApplyBlock: connect every transaction in order, collecting the entries
/// each non-coinbase transaction spends.
pub fn apply_block<V: UtxoMut + ?Sized>(
    view: &mut V,
    block: &Block,
    height: Height,
    duplicates: DuplicateOutputs,
) -> Result<BlockUndo> {
    let mut undo = BlockUndo { txs: Vec::with_capacity(block.transactions.len().saturating_sub(1)) };
    for tx in &block.transactions {
        let tx_undo = apply_transaction(view, tx, height, duplicates)?;
        if !tx.is_coinbase() {
            undo.txs.push(tx_undo);
        }
    }
    Ok(undo)
}

/// UndoBlock: walk transactions in reverse; remove each one's outputs, then
/// restore what it spent.
pub fn undo_block<V: UtxoMut + ?Sized>(view: &mut V, block: &Block, undo: &BlockUndo) -> Result<()> {
    let non_coinbase = block.transactions.iter().filter(|tx| !tx.is_coinbase()).count();
    if undo.txs.len() != non_coinbase {
        return Err(ConsensusError::Corruption(format!(
            "undo data covers {} transactions, block has {}",
            undo.txs.len(),
            non_coinbase
        )));
    }

    let mut tx_undos = undo.txs.iter().rev();
    for tx in block.transactions.iter().rev() {
        let id = txid(tx);
        for (index, output) in tx.outputs.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint::new(id, index as u32);
            if view.spend_utxo(&outpoint).is_none() {
                return Err(ConsensusError::Corruption(format!(
                    "output {}:{} missing while disconnecting",
                    hex::encode(id),
                    index
                )));
            }
        }

        if tx.is_coinbase() {
            continue;
        }
        let tx_undo = tx_undos
            .next()
            .ok_or_else(|| ConsensusError::Corruption("undo data exhausted".to_string()))?;
        for (outpoint, entry) in tx_undo.spent.iter().rev() {
            view.add_utxo(outpoint.clone(), entry.clone());
        }
    }
    Ok(())
}

/// Outputs created and entries consumed by connecting `block`.
pub fn block_delta(block: &Block, height: Height, undo: &BlockUndo) -> UtxoDelta {
    let mut created = Vec::new();
    for tx in &block.transactions {
        let id = txid(tx);
        for (index, output) in tx.outputs.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            created.push((
                OutPoint::new(id, index as u32),
                UtxoEntry {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height,
                    is_coinbase: tx.is_coinbase(),
                },
            ));
        }
    }
    let spent = undo.txs.iter().flat_map(|t| t.spent.iter().cloned()).collect();
    UtxoDelta { created, spent }
}
