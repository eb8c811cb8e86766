//! Node configuration: chain-state limits, mempool policy and script checking

use crate::error::ConsensusError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub mempool: MempoolPolicy,
    pub scripts: ScriptConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Blocks held while waiting for their parent
    pub max_orphan_blocks: usize,
    /// Hashes of malformed or work-less blocks remembered for fast rejection
    pub rejected_cache_size: usize,
    /// Events retained for consumers resuming from a sequence number
    pub event_log_capacity: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            max_orphan_blocks: 100,
            rejected_cache_size: 10_000,
            event_log_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolPolicy {
    pub max_transactions: usize,
    pub max_bytes: usize,
    /// Floor in base units per 1000 bytes
    pub min_relay_fee_rate: u64,
    /// Rate a replacement must add on top of what it displaces
    pub incremental_relay_fee_rate: u64,
    pub enable_replacement: bool,
    pub require_replacement_signal: bool,
    pub max_replacement_evictions: usize,
    pub max_standard_tx_size: usize,
    pub max_script_sig_size: usize,
    pub max_null_data_size: usize,
    pub dust_limit: i64,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        MempoolPolicy {
            max_transactions: 50_000,
            max_bytes: 300 * 1024 * 1024,
            min_relay_fee_rate: 1000,
            incremental_relay_fee_rate: 1000,
            enable_replacement: true,
            require_replacement_signal: true,
            max_replacement_evictions: 100,
            max_standard_tx_size: 100_000,
            max_script_sig_size: 1650,
            max_null_data_size: 223,
            dust_limit: 546,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Deadline for a single input's verification
    pub timeout_ms: u64,
    /// Verify the inputs of a block or batch on the rayon pool
    pub parallel: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        ScriptConfig { timeout_ms: 2000, parallel: true }
    }
}

impl ScriptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = toml::from_str(s).context("parsing TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = serde_json::from_str(s).context("parsing JSON configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_toml_str(&contents),
        };
        parsed.with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        let checks: [(bool, &str); 6] = [
            (self.chain.rejected_cache_size > 0, "chain.rejected_cache_size must be positive"),
            (self.chain.event_log_capacity > 0, "chain.event_log_capacity must be positive"),
            (self.mempool.max_transactions > 0, "mempool.max_transactions must be positive"),
            (
                self.mempool.max_bytes >= self.mempool.max_standard_tx_size,
                "mempool.max_bytes must hold at least one standard transaction",
            ),
            (self.mempool.dust_limit >= 0, "mempool.dust_limit must not be negative"),
            (self.scripts.timeout_ms > 0, "scripts.timeout_ms must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(ConsensusError::Config(msg.to_string())),
            None => Ok(()),
        }
    }
}
