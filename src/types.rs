//! Core ledger types shared by the validators, the UTXO set and the chain index

use serde::{Deserialize, Serialize};

/// Hash type: 256-bit hash, stored in internal (little-endian) byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Amount in base units
pub type Amount = i64;

/// Block height
pub type Height = u64;

/// OutPoint: reference to output `index` of transaction `hash`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        OutPoint { hash, index }
    }

    /// The outpoint carried by the single input of a coinbase transaction.
    pub fn null() -> Self {
        OutPoint { hash: [0u8; 32], index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Amount,
    pub script_pubkey: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input and that input spends the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn total_output_value(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0i64, |acc, o| acc.checked_add(o.value))
    }
}

/// Block header. Serialized form is exactly 80 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// An unspent output together with the metadata needed to validate a spend of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: Amount,
    pub script_pubkey: ByteString,
    pub height: Height,
    pub is_coinbase: bool,
}

/// Spent entries of one non-coinbase transaction, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    pub spent: Vec<(OutPoint, UtxoEntry)>,
}

/// Undo data for a connected block: one `TxUndo` per non-coinbase transaction,
/// in block order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn spent_count(&self) -> usize {
        self.txs.iter().map(|t| t.spent.len()).sum()
    }
}

/// Net change to the UTXO set caused by connecting one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoDelta {
    pub created: Vec<(OutPoint, UtxoEntry)>,
    pub spent: Vec<(OutPoint, UtxoEntry)>,
}

/// Fee rate in base units per 1000 bytes of serialized transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub fn from_fee_and_size(fee: Amount, size: usize) -> Self {
        if size == 0 || fee <= 0 {
            return FeeRate(0);
        }
        FeeRate((fee as u64).saturating_mul(1000) / size as u64)
    }

    /// Fee this rate charges for `size` bytes.
    pub fn fee_for(&self, size: usize) -> Amount {
        (self.0.saturating_mul(size as u64) / 1000) as Amount
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} per kB", self.0)
    }
}
