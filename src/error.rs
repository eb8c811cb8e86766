//! Error types for consensus validation and chain-state transitions

use thiserror::Error;

/// Rejection taxonomy every verdict is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectKind {
    /// Structurally broken data; cacheable by hash when the body is committed.
    Malformed,
    /// Depends on data not yet available (missing parent or inputs).
    NotYetConnectable,
    /// Violates a consensus rule; permanent.
    ConsensusInvalid,
    /// Violates local standardness or fee policy; not cached.
    PolicyRejected,
    /// A bounded resource is full.
    ResourceExhausted,
    /// Persistent state could not be read or written; the node must halt.
    StorageFatal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Parent block not available: {0}")]
    Orphan(String),

    #[error("Missing inputs: {0}")]
    MissingInputs(String),

    #[error("Consensus rule violation: {0}")]
    ConsensusInvalid(String),

    #[error("Rejected by policy: {0}")]
    PolicyRejected(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Script execution failed: {0}")]
    Script(#[from] ScriptError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Chain state corrupted: {0}")]
    Corruption(String),

    #[error("Storage failure: {0}")]
    StorageFatal(String),
}

impl ConsensusError {
    pub fn kind(&self) -> RejectKind {
        match self {
            ConsensusError::Malformed(_) | ConsensusError::Serialization(_) => RejectKind::Malformed,
            ConsensusError::Orphan(_) | ConsensusError::MissingInputs(_) => {
                RejectKind::NotYetConnectable
            }
            ConsensusError::ConsensusInvalid(_) | ConsensusError::Script(_) => {
                RejectKind::ConsensusInvalid
            }
            ConsensusError::PolicyRejected(_) | ConsensusError::Config(_) => {
                RejectKind::PolicyRejected
            }
            ConsensusError::ResourceExhausted(_) => RejectKind::ResourceExhausted,
            ConsensusError::Corruption(_) | ConsensusError::StorageFatal(_) => {
                RejectKind::StorageFatal
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == RejectKind::StorageFatal
    }
}

/// Failures raised by a script evaluator. Any of these rejects the spending input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("evaluation exceeded its deadline")]
    Timeout,

    #[error("script too large: {0} bytes")]
    ScriptSize(usize),

    #[error("operation limit exceeded")]
    OpCount,

    #[error("stack overflow")]
    StackSize,

    #[error("push exceeds element size limit")]
    PushSize,

    #[error("truncated push data")]
    BadPush,

    #[error("invalid stack operation")]
    InvalidStackOperation,

    #[error("disabled or unknown opcode 0x{0:02x}")]
    BadOpcode(u8),

    #[error("OP_RETURN encountered")]
    OpReturn,

    #[error("unbalanced conditional")]
    UnbalancedConditional,

    #[error("script number overflow")]
    NumOverflow,

    #[error("invalid public key count")]
    PubkeyCount,

    #[error("invalid signature count")]
    SigCount,

    #[error("VERIFY failed")]
    Verify,

    #[error("unlocking script is not push-only")]
    SigPushOnly,

    #[error("invalid signature encoding")]
    SigEncoding,

    #[error("invalid public key encoding")]
    PubkeyEncoding,

    #[error("unsupported signature hash type 0x{0:02x}")]
    SigHashType(u8),

    #[error("lock time requirement not satisfied")]
    UnsatisfiedLockTime,

    #[error("input index {0} out of range")]
    InputIndex(usize),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
