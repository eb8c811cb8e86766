//! Transaction validation: context-free checks, input checks against a UTXO
//! view, and script verification.

use crate::constants::*;
use crate::economic::money_range;
use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::script_check::{PendingCheck, ScriptChecker};
use crate::serialization::transaction_size;
use crate::types::*;
use crate::utxo::UtxoView;
use std::collections::HashSet;

/// CheckTransaction: rules that need nothing but the transaction.
///
/// 1. Inputs and outputs are non-empty
/// 2. Serialized size ≤ max block size
/// 3. Every output value and the running total lie in [0, MAX_MONEY]
/// 4. No outpoint is spent twice
/// 5. Coinbase: unlocking script length in [2, 100];
///    otherwise no input spends the null outpoint
pub fn check_transaction(tx: &Transaction, params: &ChainParams) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(ConsensusError::ConsensusInvalid("transaction has no inputs".to_string()));
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::ConsensusInvalid("transaction has no outputs".to_string()));
    }

    let size = transaction_size(tx);
    if size > params.max_block_size {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "transaction too large: {} bytes",
            size
        )));
    }

    let mut total = 0i64;
    for (i, output) in tx.outputs.iter().enumerate() {
        if !money_range(output.value) {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "output {} value {} out of range",
                i, output.value
            )));
        }
        total += output.value;
        if !money_range(total) {
            return Err(ConsensusError::ConsensusInvalid(
                "total output value out of range".to_string(),
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(&input.prevout) {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "duplicate input {}:{}",
                hex::encode(input.prevout.hash),
                input.prevout.index
            )));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "coinbase script length {} out of range",
                len
            )));
        }
    } else if tx.inputs.iter().any(|i| i.prevout.is_null()) {
        return Err(ConsensusError::ConsensusInvalid(
            "non-coinbase transaction spends the null outpoint".to_string(),
        ));
    }

    Ok(())
}

/// IsFinalTx: a transaction is final once its lock time has passed, or when
/// every input has a final sequence.
pub fn is_final_tx(tx: &Transaction, height: Height, block_time: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { block_time };
    if (tx.lock_time as u64) < cutoff {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// CheckTxInputs: validate a non-coinbase transaction's inputs against
/// `view` for a spend at `spend_height`; returns the fee.
///
/// 1. Every prevout is present in the view
/// 2. Coinbase prevouts have at least `coinbase_maturity` confirmations
/// 3. Input values and their sum lie in [0, MAX_MONEY]
/// 4. Σ inputs ≥ Σ outputs; fee = difference
pub fn check_tx_inputs<V: UtxoView + ?Sized>(
    tx: &Transaction,
    view: &V,
    spend_height: Height,
    params: &ChainParams,
) -> Result<Amount> {
    let mut total_in = 0i64;
    for input in &tx.inputs {
        let entry = view.get_utxo(&input.prevout).ok_or_else(|| {
            ConsensusError::MissingInputs(format!(
                "{}:{}",
                hex::encode(input.prevout.hash),
                input.prevout.index
            ))
        })?;

        if entry.is_coinbase && spend_height.saturating_sub(entry.height) < params.coinbase_maturity {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "premature spend of coinbase created at height {} (spend height {})",
                entry.height, spend_height
            )));
        }

        if !money_range(entry.value) {
            return Err(ConsensusError::ConsensusInvalid("input value out of range".to_string()));
        }
        total_in += entry.value;
        if !money_range(total_in) {
            return Err(ConsensusError::ConsensusInvalid(
                "total input value out of range".to_string(),
            ));
        }
    }

    let total_out = tx
        .total_output_value()
        .ok_or_else(|| ConsensusError::ConsensusInvalid("output value overflow".to_string()))?;
    if total_in < total_out {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "inputs {} below outputs {}",
            total_in, total_out
        )));
    }

    let fee = total_in - total_out;
    if !money_range(fee) {
        return Err(ConsensusError::ConsensusInvalid("fee out of range".to_string()));
    }
    Ok(fee)
}

/// Script checks for every input of `tx`, resolving prevouts through `view`.
pub fn script_checks<'a, V: UtxoView + ?Sized>(
    tx: &'a Transaction,
    view: &V,
    flags: u32,
) -> Result<Vec<PendingCheck<'a>>> {
    tx.inputs
        .iter()
        .enumerate()
        .map(|(input_index, input)| {
            let prevout = view.get_utxo(&input.prevout).ok_or_else(|| {
                ConsensusError::MissingInputs(format!(
                    "{}:{}",
                    hex::encode(input.prevout.hash),
                    input.prevout.index
                ))
            })?;
            Ok(PendingCheck { tx, input_index, prevout, flags })
        })
        .collect()
}

/// Context for validating one transaction outside a block.
#[derive(Debug, Clone, Copy)]
pub struct TxContext {
    /// Height of the block the transaction would be mined in
    pub spend_height: Height,
    pub flags: u32,
    /// Whether the transaction is expected to be a coinbase
    pub is_coinbase_context: bool,
    /// Skip script evaluation (already verified against an identical view)
    pub skip_scripts: bool,
}

/// ValidateTransaction: full validation of one transaction against a view;
/// returns the fee.
pub fn validate_transaction<V: UtxoView + ?Sized>(
    tx: &Transaction,
    view: &V,
    ctx: &TxContext,
    params: &ChainParams,
    checker: &ScriptChecker,
) -> Result<Amount> {
    check_transaction(tx, params)?;

    if tx.is_coinbase() != ctx.is_coinbase_context {
        return Err(ConsensusError::ConsensusInvalid(if ctx.is_coinbase_context {
            "expected a coinbase transaction".to_string()
        } else {
            "unexpected coinbase transaction".to_string()
        }));
    }
    if tx.is_coinbase() {
        return Ok(0);
    }

    let fee = check_tx_inputs(tx, view, ctx.spend_height, params)?;
    if !ctx.skip_scripts {
        checker.verify_all(&script_checks(tx, view, ctx.flags)?)?;
    }
    Ok(fee)
}
