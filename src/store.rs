//! Persistent chain storage behind a transactional interface.
//!
//! Blocks and index entries are written as they arrive. UTXO changes, undo
//! data and the tip pointer only change through a staged batch that commits
//! atomically, so a restart always resumes from the last committed tip.

use crate::chain_index::ChainNode;
use crate::error::{ConsensusError, Result};
use crate::types::*;
use crate::utxo::UtxoChanges;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub trait ChainStore: Send {
    fn store_block(&mut self, hash: &Hash, block: &Block) -> Result<()>;
    fn load_block(&self, hash: &Hash) -> Result<Option<Block>>;
    fn has_block(&self, hash: &Hash) -> Result<bool>;

    fn put_index_entry(&mut self, node: &ChainNode) -> Result<()>;
    fn load_index(&self) -> Result<Vec<ChainNode>>;

    fn load_undo(&self, hash: &Hash) -> Result<Option<BlockUndo>>;
    fn load_tip(&self) -> Result<Option<Hash>>;
    fn load_utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>>;

    /// Open a batch. Any batch left open is discarded.
    fn begin_apply(&mut self) -> Result<()>;
    fn stage_utxo_changes(&mut self, changes: &UtxoChanges) -> Result<()>;
    fn stage_undo(&mut self, hash: &Hash, undo: &BlockUndo) -> Result<()>;
    fn stage_remove_undo(&mut self, hash: &Hash) -> Result<()>;
    fn stage_tip(&mut self, tip: &Hash) -> Result<()>;
    /// Make every staged change durable at once, or none of them.
    fn commit(&mut self) -> Result<()>;
    fn abort(&mut self);
}

#[derive(Debug, Clone, Default)]
struct StagedBatch {
    utxos: UtxoChanges,
    undo_put: HashMap<Hash, BlockUndo>,
    undo_remove: HashSet<Hash>,
    tip: Option<Hash>,
}

impl StagedBatch {
    fn merge_utxos(&mut self, changes: &UtxoChanges) {
        for (outpoint, change) in changes {
            self.utxos.insert(outpoint.clone(), change.clone());
        }
    }

    fn put_undo(&mut self, hash: &Hash, undo: &BlockUndo) {
        self.undo_remove.remove(hash);
        self.undo_put.insert(*hash, undo.clone());
    }

    fn remove_undo(&mut self, hash: &Hash) {
        self.undo_put.remove(hash);
        self.undo_remove.insert(*hash);
    }
}

fn open_batch(staged: &mut Option<StagedBatch>) -> Result<&mut StagedBatch> {
    staged
        .as_mut()
        .ok_or_else(|| ConsensusError::StorageFatal("no batch open".to_string()))
}

/// In-memory store. Cloning copies only committed state, which models a
/// restart after a crash.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: HashMap<Hash, Block>,
    index: HashMap<Hash, ChainNode>,
    undo: HashMap<Hash, BlockUndo>,
    utxos: HashMap<OutPoint, UtxoEntry>,
    tip: Option<Hash>,
    staged: Option<StagedBatch>,
    fail_commits: bool,
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        MemoryStore {
            blocks: self.blocks.clone(),
            index: self.index.clone(),
            undo: self.undo.clone(),
            utxos: self.utxos.clone(),
            tip: self.tip,
            staged: None,
            fail_commits: false,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later commit fail, as a full or broken disk would.
    pub fn set_fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }

    pub fn undo_count(&self) -> usize {
        self.undo.len()
    }
}

impl ChainStore for MemoryStore {
    fn store_block(&mut self, hash: &Hash, block: &Block) -> Result<()> {
        self.blocks.insert(*hash, block.clone());
        Ok(())
    }

    fn load_block(&self, hash: &Hash) -> Result<Option<Block>> {
        Ok(self.blocks.get(hash).cloned())
    }

    fn has_block(&self, hash: &Hash) -> Result<bool> {
        Ok(self.blocks.contains_key(hash))
    }

    fn put_index_entry(&mut self, node: &ChainNode) -> Result<()> {
        self.index.insert(node.hash, node.clone());
        Ok(())
    }

    fn load_index(&self) -> Result<Vec<ChainNode>> {
        Ok(self.index.values().cloned().collect())
    }

    fn load_undo(&self, hash: &Hash) -> Result<Option<BlockUndo>> {
        Ok(self.undo.get(hash).cloned())
    }

    fn load_tip(&self) -> Result<Option<Hash>> {
        Ok(self.tip)
    }

    fn load_utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        Ok(self.utxos.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn begin_apply(&mut self) -> Result<()> {
        self.staged = Some(StagedBatch::default());
        Ok(())
    }

    fn stage_utxo_changes(&mut self, changes: &UtxoChanges) -> Result<()> {
        open_batch(&mut self.staged)?.merge_utxos(changes);
        Ok(())
    }

    fn stage_undo(&mut self, hash: &Hash, undo: &BlockUndo) -> Result<()> {
        open_batch(&mut self.staged)?.put_undo(hash, undo);
        Ok(())
    }

    fn stage_remove_undo(&mut self, hash: &Hash) -> Result<()> {
        open_batch(&mut self.staged)?.remove_undo(hash);
        Ok(())
    }

    fn stage_tip(&mut self, tip: &Hash) -> Result<()> {
        open_batch(&mut self.staged)?.tip = Some(*tip);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let batch = self
            .staged
            .take()
            .ok_or_else(|| ConsensusError::StorageFatal("commit without an open batch".to_string()))?;
        if self.fail_commits {
            return Err(ConsensusError::StorageFatal("commit failed".to_string()));
        }
        for (outpoint, change) in batch.utxos {
            match change {
                Some(entry) => {
                    self.utxos.insert(outpoint, entry);
                }
                None => {
                    self.utxos.remove(&outpoint);
                }
            }
        }
        for hash in batch.undo_remove {
            self.undo.remove(&hash);
        }
        self.undo.extend(batch.undo_put);
        if let Some(tip) = batch.tip {
            self.tip = Some(tip);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.staged = None;
    }
}

const TIP_KEY: &[u8] = b"tip";

fn outpoint_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.hash);
    key[32..].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

fn outpoint_from_key(key: &[u8]) -> Result<OutPoint> {
    if key.len() != 36 {
        return Err(ConsensusError::Corruption(format!("utxo key of length {}", key.len())));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&key[..32]);
    let mut index = [0u8; 4];
    index.copy_from_slice(&key[32..]);
    Ok(OutPoint::new(hash, u32::from_be_bytes(index)))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ConsensusError::StorageFatal(format!("failed to encode record: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ConsensusError::Corruption(format!("failed to decode record: {}", e)))
}

fn storage_err(context: &str, e: sled::Error) -> ConsensusError {
    ConsensusError::StorageFatal(format!("{}: {}", context, e))
}

/// Durable store backed by sled trees with bincode records.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    blocks: sled::Tree,
    index: sled::Tree,
    undo: sled::Tree,
    utxos: sled::Tree,
    meta: sled::Tree,
    staged: Option<StagedBatch>,
}

impl SledStore {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).map_err(|e| storage_err("failed to open database", e))?;
        let tree = |name: &str| db.open_tree(name).map_err(|e| storage_err("failed to open tree", e));
        Ok(SledStore {
            blocks: tree("blocks")?,
            index: tree("index")?,
            undo: tree("undo")?,
            utxos: tree("utxos")?,
            meta: tree("meta")?,
            db,
            staged: None,
        })
    }

    fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> Result<Option<T>> {
        match tree.get(key) {
            Ok(Some(data)) => Ok(Some(decode(&data)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err("failed to read record", e)),
        }
    }
}

impl ChainStore for SledStore {
    fn store_block(&mut self, hash: &Hash, block: &Block) -> Result<()> {
        self.blocks
            .insert(hash, encode(block)?)
            .map_err(|e| storage_err("failed to save block", e))?;
        Ok(())
    }

    fn load_block(&self, hash: &Hash) -> Result<Option<Block>> {
        Self::get(&self.blocks, hash)
    }

    fn has_block(&self, hash: &Hash) -> Result<bool> {
        self.blocks
            .contains_key(hash)
            .map_err(|e| storage_err("failed to read block", e))
    }

    fn put_index_entry(&mut self, node: &ChainNode) -> Result<()> {
        self.index
            .insert(node.hash, encode(node)?)
            .map_err(|e| storage_err("failed to save index entry", e))?;
        Ok(())
    }

    fn load_index(&self) -> Result<Vec<ChainNode>> {
        self.index
            .iter()
            .values()
            .map(|value| -> Result<ChainNode> {
                let value = value.map_err(|e| storage_err("failed to scan index", e))?;
                decode(&value)
            })
            .collect()
    }

    fn load_undo(&self, hash: &Hash) -> Result<Option<BlockUndo>> {
        Self::get(&self.undo, hash)
    }

    fn load_tip(&self) -> Result<Option<Hash>> {
        match self.meta.get(TIP_KEY) {
            Ok(Some(data)) if data.len() == 32 => {
                let mut tip = [0u8; 32];
                tip.copy_from_slice(&data);
                Ok(Some(tip))
            }
            Ok(Some(data)) => Err(ConsensusError::Corruption(format!("tip record of length {}", data.len()))),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err("failed to read tip", e)),
        }
    }

    fn load_utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        self.utxos
            .iter()
            .map(|item| -> Result<(OutPoint, UtxoEntry)> {
                let (key, value) = item.map_err(|e| storage_err("failed to scan utxos", e))?;
                Ok((outpoint_from_key(&key)?, decode(&value)?))
            })
            .collect()
    }

    fn begin_apply(&mut self) -> Result<()> {
        self.staged = Some(StagedBatch::default());
        Ok(())
    }

    fn stage_utxo_changes(&mut self, changes: &UtxoChanges) -> Result<()> {
        open_batch(&mut self.staged)?.merge_utxos(changes);
        Ok(())
    }

    fn stage_undo(&mut self, hash: &Hash, undo: &BlockUndo) -> Result<()> {
        open_batch(&mut self.staged)?.put_undo(hash, undo);
        Ok(())
    }

    fn stage_remove_undo(&mut self, hash: &Hash) -> Result<()> {
        open_batch(&mut self.staged)?.remove_undo(hash);
        Ok(())
    }

    fn stage_tip(&mut self, tip: &Hash) -> Result<()> {
        open_batch(&mut self.staged)?.tip = Some(*tip);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        use sled::transaction::ConflictableTransactionResult;
        use sled::Transactional;

        let batch = self
            .staged
            .take()
            .ok_or_else(|| ConsensusError::StorageFatal("commit without an open batch".to_string()))?;

        // Encode outside the transaction closure, which sled may retry.
        let mut utxo_puts = Vec::new();
        let mut utxo_removes = Vec::new();
        for (outpoint, change) in &batch.utxos {
            match change {
                Some(entry) => utxo_puts.push((outpoint_key(outpoint), encode(entry)?)),
                None => utxo_removes.push(outpoint_key(outpoint)),
            }
        }
        let mut undo_puts = Vec::new();
        for (hash, undo) in &batch.undo_put {
            undo_puts.push((*hash, encode(undo)?));
        }

        (&self.utxos, &self.undo, &self.meta)
            .transaction(|(utxos, undo, meta)| -> ConflictableTransactionResult<(), ()> {
                for key in &utxo_removes {
                    utxos.remove(&key[..])?;
                }
                for (key, value) in &utxo_puts {
                    utxos.insert(&key[..], value.as_slice())?;
                }
                for hash in &batch.undo_remove {
                    undo.remove(&hash[..])?;
                }
                for (hash, value) in &undo_puts {
                    undo.insert(&hash[..], value.as_slice())?;
                }
                if let Some(tip) = &batch.tip {
                    meta.insert(TIP_KEY, &tip[..])?;
                }
                Ok(())
            })
            .map_err(|e| ConsensusError::StorageFatal(format!("commit failed: {:?}", e)))?;

        self.db
            .flush()
            .map_err(|e| storage_err("failed to flush commit", e))?;
        Ok(())
    }

    fn abort(&mut self) {
        self.staged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_index::ChainIndex;
    use crate::params::ChainParams;

    fn entry(value: Amount) -> UtxoEntry {
        UtxoEntry { value, script_pubkey: vec![0x51], height: 3, is_coinbase: false }
    }

    fn exercise_batch<S: ChainStore>(store: &mut S) {
        let a = OutPoint::new([1; 32], 0);
        let b = OutPoint::new([2; 32], 7);
        let mut changes = UtxoChanges::new();
        changes.insert(a.clone(), Some(entry(10)));
        changes.insert(b.clone(), Some(entry(20)));

        store.begin_apply().unwrap();
        store.stage_utxo_changes(&changes).unwrap();
        store.stage_undo(&[9; 32], &BlockUndo::default()).unwrap();
        store.stage_tip(&[9; 32]).unwrap();
        store.commit().unwrap();

        assert_eq!(store.load_tip().unwrap(), Some([9; 32]));
        assert_eq!(store.load_utxos().unwrap().len(), 2);
        assert!(store.load_undo(&[9; 32]).unwrap().is_some());

        // aborted batches leave nothing behind
        let mut removal = UtxoChanges::new();
        removal.insert(a.clone(), None);
        store.begin_apply().unwrap();
        store.stage_utxo_changes(&removal).unwrap();
        store.stage_tip(&[8; 32]).unwrap();
        store.abort();
        assert_eq!(store.load_tip().unwrap(), Some([9; 32]));
        assert_eq!(store.load_utxos().unwrap().len(), 2);

        store.begin_apply().unwrap();
        store.stage_utxo_changes(&removal).unwrap();
        store.stage_remove_undo(&[9; 32]).unwrap();
        store.commit().unwrap();
        let remaining = store.load_utxos().unwrap();
        assert_eq!(remaining, vec![(b, entry(20))]);
        assert!(store.load_undo(&[9; 32]).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_batches() {
        let mut store = MemoryStore::new();
        exercise_batch(&mut store);
        assert!(store.stage_tip(&[1; 32]).is_err());
    }

    #[test]
    fn test_memory_store_failed_commit_keeps_state() {
        let mut store = MemoryStore::new();
        store.set_fail_commits(true);
        store.begin_apply().unwrap();
        store.stage_tip(&[1; 32]).unwrap();
        assert!(store.commit().unwrap_err().is_fatal());
        assert_eq!(store.load_tip().unwrap(), None);
    }

    #[test]
    fn test_sled_store_batches_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let genesis = params.genesis_block();
        let index = ChainIndex::new(&genesis.header);
        let genesis_hash = index.genesis_hash();
        {
            let mut store = SledStore::open(dir.path()).unwrap();
            exercise_batch(&mut store);
            store.store_block(&genesis_hash, &genesis).unwrap();
            for node in index.nodes() {
                store.put_index_entry(node).unwrap();
            }
        }

        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.load_tip().unwrap(), Some([9; 32]));
        assert_eq!(store.load_utxos().unwrap().len(), 1);
        assert_eq!(store.load_block(&genesis_hash).unwrap(), Some(genesis));
        assert!(store.has_block(&genesis_hash).unwrap());
        let nodes = store.load_index().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hash, genesis_hash);
    }
}
