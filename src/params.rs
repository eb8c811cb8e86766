//! Per-chain consensus parameters

use crate::constants::*;
use crate::serialization::block_merkle_root;
use crate::types::*;
use crate::utxo::DuplicateOutputs;

/// Consensus parameters of one chain. Two nodes agree on validity only if
/// they share every field here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub name: &'static str,

    pub genesis_version: i32,
    pub genesis_timestamp: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,

    /// Easiest permitted target, in compact form
    pub pow_limit_bits: u32,
    /// Keep the parent's target forever (test chains)
    pub pow_no_retargeting: bool,
    /// Blocks between target recalculations
    pub retarget_interval: u64,
    /// Expected seconds per retarget window
    pub target_timespan: u64,
    pub target_spacing: u64,

    pub coinbase_maturity: u64,
    pub subsidy_halving_interval: u64,

    pub max_block_size: usize,
    pub max_block_sigops: usize,
    /// Seconds a header timestamp may run ahead of local time
    pub max_future_block_time: u64,

    /// Heights at which soft-fork rules become mandatory
    pub bip34_height: Height,
    pub bip65_height: Height,
    pub bip66_height: Height,
    pub p2sh_height: Height,

    /// Blocks allowed to recreate an unspent coinbase output (BIP30)
    pub bip30_exceptions: Vec<(Height, Hash)>,
}

/// Hash from its conventional reversed-hex display form.
fn display_hash(hex_str: &str) -> Option<Hash> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut hash).ok()?;
    hash.reverse();
    Some(hash)
}

impl ChainParams {
    pub fn mainnet() -> Self {
        ChainParams {
            name: "main",
            genesis_version: 1,
            genesis_timestamp: 1231006505,
            genesis_bits: 0x1d00ffff,
            genesis_nonce: 2083236893,
            pow_limit_bits: 0x1d00ffff,
            pow_no_retargeting: false,
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            target_spacing: 10 * 60,
            coinbase_maturity: 100,
            subsidy_halving_interval: 210_000,
            max_block_size: 1_000_000,
            max_block_sigops: 20_000,
            max_future_block_time: 2 * 60 * 60,
            bip34_height: 227_931,
            bip65_height: 388_381,
            bip66_height: 363_725,
            p2sh_height: 173_805,
            bip30_exceptions: [
                (91_842, "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
                (91_880, "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
            ]
            .into_iter()
            .filter_map(|(height, hex_str)| display_hash(hex_str).map(|hash| (height, hash)))
            .collect(),
        }
    }

    /// Local test chain: trivial proof of work, no retargeting, early halvings.
    pub fn regtest() -> Self {
        ChainParams {
            name: "regtest",
            genesis_timestamp: 1296688602,
            genesis_bits: 0x207fffff,
            genesis_nonce: 2,
            pow_limit_bits: 0x207fffff,
            pow_no_retargeting: true,
            subsidy_halving_interval: 150,
            bip34_height: 100_000_000,
            bip65_height: 1351,
            bip66_height: 1251,
            p2sh_height: 0,
            bip30_exceptions: Vec::new(),
            ..ChainParams::mainnet()
        }
    }

    pub fn genesis_block(&self) -> Block {
        let coinbase = genesis_coinbase();
        let mut block = Block {
            header: BlockHeader {
                version: self.genesis_version,
                prev_block_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: self.genesis_timestamp,
                bits: self.genesis_bits,
                nonce: self.genesis_nonce,
            },
            transactions: vec![coinbase],
        };
        if let Some((root, _)) = block_merkle_root(&block) {
            block.header.merkle_root = root;
        }
        block
    }

    /// Lowest header version accepted at `height`.
    pub fn min_block_version(&self, height: Height) -> i32 {
        if height >= self.bip65_height {
            4
        } else if height >= self.bip66_height {
            3
        } else if height >= self.bip34_height {
            2
        } else {
            1
        }
    }

    /// Whether the block at `height` may overwrite unspent outputs.
    pub fn duplicate_outputs(&self, height: Height, hash: &Hash) -> DuplicateOutputs {
        if self.bip30_exceptions.iter().any(|(h, x)| *h == height && x == hash) {
            DuplicateOutputs::Overwrite
        } else {
            DuplicateOutputs::Reject
        }
    }

    /// Script verification flags mandatory for blocks at `height`.
    pub fn script_flags(&self, height: Height) -> u32 {
        let mut flags = SCRIPT_VERIFY_NONE;
        if height >= self.p2sh_height {
            flags |= SCRIPT_VERIFY_P2SH;
        }
        if height >= self.bip66_height {
            flags |= SCRIPT_VERIFY_DERSIG;
        }
        if height >= self.bip65_height {
            flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        flags
    }
}

const GENESIS_MESSAGE: &[u8] = b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_OUTPUT_PUBKEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

fn genesis_coinbase() -> Transaction {
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, GENESIS_MESSAGE.len() as u8];
    script_sig.extend_from_slice(GENESIS_MESSAGE);

    let mut script_pubkey = vec![GENESIS_OUTPUT_PUBKEY.len() as u8];
    script_pubkey.extend_from_slice(&GENESIS_OUTPUT_PUBKEY);
    script_pubkey.push(0xac);

    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value: INITIAL_SUBSIDY,
            script_pubkey,
        }],
        lock_time: 0,
    }
}
