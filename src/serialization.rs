//! Wire encoding and consensus hashing
//!
//! Integers are fixed-width little-endian, collection lengths use the
//! CompactSize variable-length encoding. Transaction ids and block hashes are
//! the double SHA-256 of these exact bytes.

use crate::constants::HEADER_SIZE;
use crate::error::{ConsensusError, Result};
use crate::types::*;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Append a CompactSize length prefix.
///
/// - value < 0xfd: 1 byte
/// - value ≤ 0xffff: 0xfd + 2 bytes
/// - value ≤ 0xffffffff: 0xfe + 4 bytes
/// - otherwise: 0xff + 8 bytes
pub fn encode_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn serialize_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(&header.version.to_le_bytes());
    bytes[4..36].copy_from_slice(&header.prev_block_hash);
    bytes[36..68].copy_from_slice(&header.merkle_root);
    bytes[68..72].copy_from_slice(&header.timestamp.to_le_bytes());
    bytes[72..76].copy_from_slice(&header.bits.to_le_bytes());
    bytes[76..80].copy_from_slice(&header.nonce.to_le_bytes());
    bytes
}

pub fn write_transaction(out: &mut Vec<u8>, tx: &Transaction) {
    out.extend_from_slice(&tx.version.to_le_bytes());

    encode_varint(out, tx.inputs.len() as u64);
    for input in &tx.inputs {
        out.extend_from_slice(&input.prevout.hash);
        out.extend_from_slice(&input.prevout.index.to_le_bytes());
        encode_varint(out, input.script_sig.len() as u64);
        out.extend_from_slice(&input.script_sig);
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }

    encode_varint(out, tx.outputs.len() as u64);
    for output in &tx.outputs {
        out.extend_from_slice(&output.value.to_le_bytes());
        encode_varint(out, output.script_pubkey.len() as u64);
        out.extend_from_slice(&output.script_pubkey);
    }

    out.extend_from_slice(&tx.lock_time.to_le_bytes());
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(transaction_size(tx));
    write_transaction(&mut out, tx);
    out
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(block_size(block));
    out.extend_from_slice(&serialize_header(&block.header));
    encode_varint(&mut out, block.transactions.len() as u64);
    for tx in &block.transactions {
        write_transaction(&mut out, tx);
    }
    out
}

/// Serialized size of a transaction, computed without allocating.
pub fn transaction_size(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|i| 36 + varint_size(i.script_sig.len() as u64) + i.script_sig.len() + 4)
        .sum();
    let outputs: usize = tx
        .outputs
        .iter()
        .map(|o| 8 + varint_size(o.script_pubkey.len() as u64) + o.script_pubkey.len())
        .sum();
    4 + varint_size(tx.inputs.len() as u64)
        + inputs
        + varint_size(tx.outputs.len() as u64)
        + outputs
        + 4
}

pub fn block_size(block: &Block) -> usize {
    HEADER_SIZE
        + varint_size(block.transactions.len() as u64)
        + block.transactions.iter().map(transaction_size).sum::<usize>()
}

/// Cursor over a byte slice with bounds-checked reads.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ConsensusError::Serialization(format!(
                "unexpected end of data: wanted {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        self.read_array()
    }

    /// Read a CompactSize, rejecting non-canonical encodings.
    pub fn read_varint(&mut self) -> Result<u64> {
        let first = self.read_array::<1>()?[0];
        let (value, min) = match first {
            0xfd => (u16::from_le_bytes(self.read_array()?) as u64, 0xfd),
            0xfe => (u32::from_le_bytes(self.read_array()?) as u64, 0x1_0000),
            0xff => (u64::from_le_bytes(self.read_array()?), 0x1_0000_0000),
            n => return Ok(n as u64),
        };
        if value < min {
            return Err(ConsensusError::Serialization(format!(
                "non-canonical compact size {}",
                value
            )));
        }
        Ok(value)
    }

    /// Read a length prefix that counts items of at least `min_item_size` bytes.
    fn read_count(&mut self, min_item_size: usize) -> Result<usize> {
        let count = self.read_varint()?;
        if count.saturating_mul(min_item_size as u64) > self.remaining() as u64 {
            return Err(ConsensusError::Serialization(format!(
                "length prefix {} exceeds remaining data",
                count
            )));
        }
        Ok(count as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count(1)?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ConsensusError::Serialization(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

pub fn read_header(reader: &mut Reader<'_>) -> Result<BlockHeader> {
    Ok(BlockHeader {
        version: reader.read_i32()?,
        prev_block_hash: reader.read_hash()?,
        merkle_root: reader.read_hash()?,
        timestamp: reader.read_u32()?,
        bits: reader.read_u32()?,
        nonce: reader.read_u32()?,
    })
}

pub fn read_transaction(reader: &mut Reader<'_>) -> Result<Transaction> {
    let version = reader.read_i32()?;

    let input_count = reader.read_count(41)?;
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        let hash = reader.read_hash()?;
        let index = reader.read_u32()?;
        let script_sig = reader.read_var_bytes()?;
        let sequence = reader.read_u32()?;
        inputs.push(TransactionInput {
            prevout: OutPoint { hash, index },
            script_sig,
            sequence,
        });
    }

    let output_count = reader.read_count(9)?;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        let value = reader.read_i64()?;
        let script_pubkey = reader.read_var_bytes()?;
        outputs.push(TransactionOutput { value, script_pubkey });
    }

    let lock_time = reader.read_u32()?;
    Ok(Transaction { version, inputs, outputs, lock_time })
}

pub fn deserialize_header(bytes: &[u8]) -> Result<BlockHeader> {
    let mut reader = Reader::new(bytes);
    let header = read_header(&mut reader)?;
    reader.finish()?;
    Ok(header)
}

pub fn deserialize_transaction(bytes: &[u8]) -> Result<Transaction> {
    let mut reader = Reader::new(bytes);
    let tx = read_transaction(&mut reader)?;
    reader.finish()?;
    Ok(tx)
}

pub fn deserialize_block(bytes: &[u8]) -> Result<Block> {
    let mut reader = Reader::new(bytes);
    let header = read_header(&mut reader)?;
    let tx_count = reader.read_count(60)?;
    let mut transactions = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        transactions.push(read_transaction(&mut reader)?);
    }
    reader.finish()?;
    Ok(Block { header, transactions })
}

/// Double SHA-256
pub fn sha256d(data: &[u8]) -> Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(data);
    let result = sha256d::Hash::from_engine(engine);

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(&sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

pub fn txid(tx: &Transaction) -> Hash {
    sha256d(&serialize_transaction(tx))
}

pub fn block_hash(header: &BlockHeader) -> Hash {
    sha256d(&serialize_header(header))
}

/// Merkle root over transaction ids.
///
/// Each level pairs adjacent hashes and hashes their concatenation; an odd
/// trailing hash is paired with itself. Returns `None` for an empty list.
/// The second value reports whether any level paired two identical hashes,
/// which allows a mutated transaction list to share a root with the original.
pub fn merkle_root(txids: &[Hash]) -> Option<(Hash, bool)> {
    if txids.is_empty() {
        return None;
    }

    let mut level = txids.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            if pair.len() == 2 && left == right {
                mutated = true;
            }
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&left);
            combined[32..].copy_from_slice(&right);
            next.push(sha256d(&combined));
        }
        level = next;
    }
    Some((level[0], mutated))
}

pub fn block_merkle_root(block: &Block) -> Option<(Hash, bool)> {
    let ids: Vec<Hash> = block.transactions.iter().map(txid).collect();
    merkle_root(&ids)
}

/// Hash in the conventional display order (reversed bytes, hex).
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new([7; 32], 3),
                script_sig: vec![0x51; 300],
                sequence: 0xfffffffe,
            }],
            outputs: vec![
                TransactionOutput { value: 5000, script_pubkey: vec![0x76, 0xa9] },
                TransactionOutput { value: 0, script_pubkey: vec![] },
            ],
            lock_time: 17,
        }
    }

    #[test]
    fn test_varint_boundaries() {
        for (value, len) in [(0u64, 1), (0xfc, 1), (0xfd, 3), (0xffff, 3), (0x10000, 5), (0x1_0000_0000, 9)] {
            let mut out = Vec::new();
            encode_varint(&mut out, value);
            assert_eq!(out.len(), len);
            assert_eq!(varint_size(value), len);
            let mut reader = Reader::new(&out);
            assert_eq!(reader.read_varint().unwrap(), value);
        }
    }

    #[test]
    fn test_non_canonical_varint_rejected() {
        let bytes = [0xfd, 0x10, 0x00];
        let mut reader = Reader::new(&bytes);
        assert!(reader.read_varint().is_err());
    }

    #[test]
    fn test_transaction_size_matches_encoding() {
        let tx = sample_tx();
        assert_eq!(serialize_transaction(&tx).len(), transaction_size(&tx));
        let decoded = deserialize_transaction(&serialize_transaction(&tx)).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = serialize_transaction(&sample_tx());
        bytes.push(0);
        assert!(matches!(
            deserialize_transaction(&bytes),
            Err(ConsensusError::Serialization(_))
        ));
    }

    #[test]
    fn test_truncated_block_rejected() {
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [1; 32],
                merkle_root: [2; 32],
                timestamp: 1,
                bits: 0x207fffff,
                nonce: 9,
            },
            transactions: vec![sample_tx()],
        };
        let bytes = serialize_block(&block);
        assert_eq!(bytes.len(), block_size(&block));
        assert_eq!(deserialize_block(&bytes).unwrap(), block);
        assert!(deserialize_block(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_huge_count_rejected_without_allocating() {
        let mut bytes = vec![1, 0, 0, 0];
        encode_varint(&mut bytes, u32::MAX as u64);
        assert!(deserialize_transaction(&bytes).is_err());
    }

    #[test]
    fn test_merkle_root_single_and_odd() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert_eq!(merkle_root(&[a]), Some((a, false)));
        assert_eq!(merkle_root(&[]), None);

        let (odd, mutated) = merkle_root(&[a, b, c]).unwrap();
        let (dup, dup_mutated) = merkle_root(&[a, b, c, c]).unwrap();
        assert_eq!(odd, dup);
        assert!(!mutated);
        assert!(dup_mutated);
    }

    #[test]
    fn test_sha256d_known_vector() {
        // sha256d("") = 5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_hash_to_hex_reverses() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        assert!(hash_to_hex(&hash).ends_with("ab"));
    }
}
