//! # Consensus-Chainstate
//!
//! Consensus validation and chain-state management for a proof-of-work UTXO
//! ledger with Bitcoin-style blocks and transactions.
//!
//! ## Architecture
//!
//! The crate is layered bottom-up:
//! - Encoding and hashing (`serialization`), consensus parameters (`params`)
//! - Rule checks: `transaction`, `block`, `pow`, `economic`, `script`
//! - State: `utxo` (set, overlays, apply/undo), `chain_index` (block tree),
//!   `store` (atomic persistence)
//! - Transitions: `reorganization`, `chainstate`, `mempool`
//! - `node`: a single writer that serializes every transition, publishes
//!   frozen snapshots and emits sequenced `events`
//!
//! ## Design Principles
//!
//! 1. **Explicit rejections**: every check returns a `Result` whose error
//!    carries one of the [`RejectKind`]s
//! 2. **All-or-nothing transitions**: a block, reorganization or mempool
//!    admission either fully applies or leaves no trace
//! 3. **Single writer**: readers work on snapshots and never block a
//!    transition
//!
//! ## Usage
//!
//! ```rust
//! use consensus_chainstate::{ChainParams, MemoryStore, Node, NodeConfig};
//!
//! let node = Node::open(ChainParams::regtest(), NodeConfig::default(), MemoryStore::new())?;
//! let snapshot = node.snapshot();
//! assert_eq!(snapshot.height, 0);
//! assert_eq!(snapshot.utxos.len(), 1);
//! # Ok::<(), consensus_chainstate::ConsensusError>(())
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod serialization;
pub mod params;
pub mod config;
pub mod pow;
pub mod economic;
pub mod script;
pub mod script_check;
pub mod utxo;
pub mod transaction;
pub mod block;
pub mod chain_index;
pub mod store;
pub mod reorganization;
pub mod chainstate;
pub mod mempool;
pub mod events;
pub mod node;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{ConsensusError, RejectKind, Result, ScriptError};

pub use chain_index::{BlockStatus, ChainIndex, ChainNode};
pub use chainstate::{BlockAcceptance, BlockResult, ChainState, Clock, FixedClock, SystemClock, TipUpdate};
pub use config::{ChainConfig, MempoolPolicy, NodeConfig, ScriptConfig};
pub use events::{ChainEvent, EventBus, EvictionReason, SequencedEvent};
pub use mempool::{AcceptOptions, Mempool, MempoolEntry};
pub use node::{ChainSnapshot, Node};
pub use params::ChainParams;
pub use script_check::{ScriptCheck, ScriptChecker, ScriptVerifier};
pub use store::{ChainStore, MemoryStore, SledStore};
pub use utxo::{UtxoSet, UtxoView};
