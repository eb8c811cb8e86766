//! Consensus and policy constants that do not vary between chains

/// Maximum money supply: 21,000,000 coins in base units
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Base units per coin
pub const COIN: i64 = 100_000_000;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: i64 = 50 * COIN;

/// Serialized header length in bytes
pub const HEADER_SIZE: usize = 80;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum stack size during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations in a script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Coinbase unlocking script length bounds
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Lock time threshold: lock times below this are block heights
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for a final input
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Inputs with a sequence below this signal replaceability
pub const SEQUENCE_REPLACEABLE_MAX: u32 = 0xfffffffd;

/// Number of ancestors whose timestamps form the median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Signature operations charged for a bare multisig opcode
pub const MULTISIG_SIGOPS: usize = 20;

/// Hash type for legacy signatures committing to all inputs and outputs
pub const SIGHASH_ALL: u8 = 0x01;

/// Script verification flags
pub const SCRIPT_VERIFY_NONE: u32 = 0;
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: u32 = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: u32 = 1 << 2;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;

/// Flags applied to every mempool candidate regardless of height
pub const STANDARD_SCRIPT_VERIFY_FLAGS: u32 = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
