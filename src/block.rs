//! Block validation: structural checks, header checks with and without the
//! parent context, and per-transaction connection checks against a view.

use crate::constants::*;
use crate::economic::{get_block_subsidy, money_range};
use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::pow::check_proof_of_work;
use crate::script::{count_p2sh_sigops, count_sigops, push_int};
use crate::script_check::ScriptChecker;
use crate::serialization::{block_hash, block_merkle_root, block_size};
use crate::transaction::{check_transaction, check_tx_inputs, is_final_tx, script_checks};
use crate::types::*;
use crate::utxo::{apply_transaction, UtxoOverlay, UtxoView};
use std::collections::HashSet;

/// Outcome of a fully validated block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockVerdict {
    pub fees: Amount,
    pub sigops: usize,
}

/// Facts about the parent chain needed to judge a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderContext {
    pub height: Height,
    /// Output of the retarget algorithm for this height
    pub expected_bits: u32,
    pub median_time_past: u32,
}

/// Whether the header's merkle root commits to exactly this transaction
/// list. Only then may a structural rejection be remembered by block hash.
pub fn merkle_commits_body(block: &Block) -> bool {
    matches!(block_merkle_root(block), Some((root, false)) if root == block.header.merkle_root)
}

fn legacy_sigops(tx: &Transaction) -> usize {
    tx.inputs.iter().map(|i| count_sigops(&i.script_sig, false)).sum::<usize>()
        + tx.outputs.iter().map(|o| count_sigops(&o.script_pubkey, false)).sum::<usize>()
}

/// CheckBlock: structure that can be verified from the block alone.
///
/// 1. At least one transaction; serialized size ≤ max block size
/// 2. First transaction is a coinbase, no other is
/// 3. Every transaction passes context-free checks
/// 4. Merkle root matches and the transaction list is not a duplicated mutation
/// 5. Legacy signature operations ≤ max block sigops
pub fn check_block(block: &Block, params: &ChainParams) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(ConsensusError::Malformed("block has no transactions".to_string()));
    }

    let size = block_size(block);
    if size > params.max_block_size {
        return Err(ConsensusError::Malformed(format!("block size {} exceeds limit", size)));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::Malformed("first transaction is not a coinbase".to_string()));
    }
    if block.transactions.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(ConsensusError::Malformed("more than one coinbase".to_string()));
    }

    for (i, tx) in block.transactions.iter().enumerate() {
        check_transaction(tx, params)
            .map_err(|e| ConsensusError::Malformed(format!("transaction {}: {}", i, e)))?;
    }

    match block_merkle_root(block) {
        Some((_, true)) => {
            return Err(ConsensusError::Malformed("duplicate transactions in merkle tree".to_string()))
        }
        Some((root, false)) if root == block.header.merkle_root => {}
        _ => return Err(ConsensusError::Malformed("merkle root mismatch".to_string())),
    }

    let sigops: usize = block.transactions.iter().map(legacy_sigops).sum();
    if sigops > params.max_block_sigops {
        return Err(ConsensusError::Malformed(format!("too many signature operations: {}", sigops)));
    }

    Ok(())
}

/// CheckBlockHeader: proof of work and a timestamp no further than
/// `max_future_block_time` past `now`.
pub fn check_block_header(header: &BlockHeader, params: &ChainParams, now: u64) -> Result<()> {
    check_proof_of_work(header, params)?;
    check_header_time(header, params, now)
}

/// A header too far ahead of local time may become acceptable later, so
/// callers must not remember this failure.
pub fn check_header_time(header: &BlockHeader, params: &ChainParams, now: u64) -> Result<()> {
    if header.timestamp as u64 > now + params.max_future_block_time {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "block timestamp {} too far in the future",
            header.timestamp
        )));
    }
    Ok(())
}

/// ContextualCheckBlockHeader
///
/// 1. `bits` equals the retarget output for this height
/// 2. timestamp > median time past of the parent
/// 3. version meets the floor of every activated rule
pub fn contextual_check_header(header: &BlockHeader, ctx: &HeaderContext, params: &ChainParams) -> Result<()> {
    if header.bits != ctx.expected_bits {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "incorrect difficulty bits 0x{:08x}, expected 0x{:08x}",
            header.bits, ctx.expected_bits
        )));
    }
    if header.timestamp <= ctx.median_time_past {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "timestamp {} not after median time past {}",
            header.timestamp, ctx.median_time_past
        )));
    }
    let floor = params.min_block_version(ctx.height);
    if header.version < floor {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "block version {} below {} required at height {}",
            header.version, floor, ctx.height
        )));
    }
    Ok(())
}

/// Serialized height a coinbase must begin with once BIP34 is active.
pub fn coinbase_height_prefix(height: Height) -> Vec<u8> {
    let mut script = Vec::new();
    push_int(&mut script, height as i64);
    script
}

/// ContextualCheckBlock: height commitment in the coinbase and finality of
/// every transaction at this height and block time.
pub fn contextual_check_block(block: &Block, height: Height, params: &ChainParams) -> Result<()> {
    if height >= params.bip34_height {
        let prefix = coinbase_height_prefix(height);
        let starts_with_height = block
            .coinbase()
            .map(|cb| cb.inputs[0].script_sig.starts_with(&prefix))
            .unwrap_or(false);
        if !starts_with_height {
            return Err(ConsensusError::ConsensusInvalid(
                "coinbase does not commit to block height".to_string(),
            ));
        }
    }

    let block_time = block.header.timestamp as u64;
    if let Some(i) = block
        .transactions
        .iter()
        .position(|tx| !is_final_tx(tx, height, block_time))
    {
        return Err(ConsensusError::ConsensusInvalid(format!("transaction {} is not final", i)));
    }
    Ok(())
}

/// Median of the timestamps of up to the last eleven blocks.
pub fn median_time_past(timestamps: &[u32]) -> u32 {
    if timestamps.is_empty() {
        return 0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

/// ConnectBlockChecks: validate every transaction against `view` as if the
/// block were being connected at `height`. The view is not modified.
///
/// 1. Transactions may spend outputs created earlier in the same block
/// 2. No outpoint is consumed twice; no unspent outpoint is overwritten
///    outside the chain's BIP30 exceptions
/// 3. Signature operations including pay-to-script-hash ≤ limit
/// 4. Fees summed in range; coinbase claims ≤ subsidy + fees
/// 5. All input scripts verify
pub fn connect_block_checks<V: UtxoView + ?Sized>(
    block: &Block,
    height: Height,
    view: &V,
    params: &ChainParams,
    checker: &ScriptChecker,
) -> Result<BlockVerdict> {
    let flags = params.script_flags(height);
    let duplicates = params.duplicate_outputs(height, &block_hash(&block.header));
    let mut overlay = UtxoOverlay::new(view);
    let mut consumed = HashSet::new();
    let mut fees = 0i64;
    let mut sigops = 0usize;
    let mut checks = Vec::new();

    for (i, tx) in block.transactions.iter().enumerate() {
        sigops += legacy_sigops(tx);

        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if !consumed.insert(input.prevout.clone()) {
                    return Err(ConsensusError::ConsensusInvalid(format!(
                        "transaction {} double-spends {}:{} within the block",
                        i,
                        hex::encode(input.prevout.hash),
                        input.prevout.index
                    )));
                }
            }

            let fee = check_tx_inputs(tx, &overlay, height, params).map_err(|e| match e {
                ConsensusError::MissingInputs(what) => {
                    ConsensusError::ConsensusInvalid(format!("transaction {} spends missing output {}", i, what))
                }
                other => other,
            })?;
            fees += fee;
            if !money_range(fees) {
                return Err(ConsensusError::ConsensusInvalid("accumulated fees out of range".to_string()));
            }

            if flags & SCRIPT_VERIFY_P2SH != 0 {
                for input in &tx.inputs {
                    if let Some(prev) = overlay.get_utxo(&input.prevout) {
                        sigops += count_p2sh_sigops(&input.script_sig, &prev.script_pubkey);
                    }
                }
            }

            checks.extend(script_checks(tx, &overlay, flags)?);
        }

        if sigops > params.max_block_sigops {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "too many signature operations: {}",
                sigops
            )));
        }

        apply_transaction(&mut overlay, tx, height, duplicates)?;
    }

    let claimed = block
        .coinbase()
        .and_then(Transaction::total_output_value)
        .ok_or_else(|| ConsensusError::ConsensusInvalid("coinbase value overflow".to_string()))?;
    let allowed = get_block_subsidy(height, params) + fees;
    if claimed > allowed {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "coinbase pays {} but only {} is available",
            claimed, allowed
        )));
    }

    checker.verify_all(&checks)?;

    Ok(BlockVerdict { fees, sigops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptConfig;
    use crate::error::RejectKind;
    use crate::serialization::txid;
    use crate::utxo::{UtxoMut, UtxoSet};

    fn coinbase(height: Height, value: Amount) -> Transaction {
        let mut script_sig = coinbase_height_prefix(height);
        script_sig.push(0x00);
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout: OutPoint::null(), script_sig, sequence: u32::MAX }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn spend(prevout: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout, script_sig: vec![], sequence: u32::MAX }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn make_block(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [0; 32],
                merkle_root: [0; 32],
                timestamp: 1_300_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block_merkle_root(&block).unwrap().0;
        block
    }

    fn checker() -> ScriptChecker {
        ScriptChecker::standard(&ScriptConfig::default())
    }

    fn funded_view(value: Amount) -> (UtxoSet, OutPoint) {
        let mut view = UtxoSet::new();
        let outpoint = OutPoint::new([0xaa; 32], 0);
        view.add_utxo(outpoint.clone(), UtxoEntry { value, script_pubkey: vec![0x51], height: 1, is_coinbase: false });
        (view, outpoint)
    }

    #[test]
    fn test_check_block_structure() {
        let params = ChainParams::regtest();
        let good = make_block(vec![coinbase(1, 50 * COIN)]);
        assert!(check_block(&good, &params).is_ok());
        assert!(merkle_commits_body(&good));

        let empty = Block { header: good.header.clone(), transactions: vec![] };
        assert_eq!(check_block(&empty, &params).unwrap_err().kind(), RejectKind::Malformed);

        let no_coinbase = make_block(vec![spend(OutPoint::new([1; 32], 0), 1)]);
        assert!(check_block(&no_coinbase, &params).is_err());

        let two_coinbases = make_block(vec![coinbase(1, 1), coinbase(2, 1)]);
        assert!(check_block(&two_coinbases, &params).is_err());

        let mut bad_root = good.clone();
        bad_root.header.merkle_root = [0x55; 32];
        assert!(check_block(&bad_root, &params).is_err());
        assert!(!merkle_commits_body(&bad_root));
    }

    #[test]
    fn test_duplicated_transaction_mutation_rejected() {
        let params = ChainParams::regtest();
        let tx = spend(OutPoint::new([1; 32], 0), 1);
        let original = make_block(vec![coinbase(1, 1), tx.clone(), spend(OutPoint::new([2; 32], 0), 1)]);
        let mut mutated = original.clone();
        mutated.transactions.push(mutated.transactions[2].clone());
        mutated.header.merkle_root = original.header.merkle_root;

        assert!(check_block(&mutated, &params).is_err());
        assert!(!merkle_commits_body(&mutated));
    }

    #[test]
    fn test_header_future_time() {
        let params = ChainParams::mainnet();
        let header = params.genesis_block().header;
        let now = header.timestamp as u64;
        assert!(check_block_header(&header, &params, now).is_ok());
        assert!(check_block_header(&header, &params, now - params.max_future_block_time - 1).is_err());
    }

    #[test]
    fn test_contextual_header_checks() {
        let params = ChainParams::regtest();
        let header = make_block(vec![coinbase(1, 1)]).header;
        let ctx = HeaderContext { height: 1, expected_bits: 0x207fffff, median_time_past: header.timestamp - 1 };
        assert!(contextual_check_header(&header, &ctx, &params).is_ok());

        let stale = HeaderContext { median_time_past: header.timestamp, ..ctx };
        assert!(contextual_check_header(&header, &stale, &params).is_err());

        let wrong_bits = HeaderContext { expected_bits: 0x1d00ffff, ..ctx };
        assert!(contextual_check_header(&header, &wrong_bits, &params).is_err());

        let versioned = HeaderContext { height: params.bip66_height, ..ctx };
        assert!(contextual_check_header(&header, &versioned, &params).is_err());
    }

    #[test]
    fn test_coinbase_height_commitment() {
        let mut params = ChainParams::regtest();
        params.bip34_height = 2;
        let committed = make_block(vec![coinbase(2, 1)]);
        assert!(contextual_check_block(&committed, 2, &params).is_ok());
        assert!(contextual_check_block(&committed, 3, &params).is_err());
        assert!(contextual_check_block(&committed, 1, &params).is_ok());
    }

    #[test]
    fn test_median_time_past() {
        assert_eq!(median_time_past(&[5, 1, 3]), 3);
        assert_eq!(median_time_past(&[1, 2, 3, 4]), 3);
        assert_eq!(median_time_past(&[]), 0);
    }

    #[test]
    fn test_connect_checks_fees_and_coinbase_limit() {
        let params = ChainParams::regtest();
        let (view, funding) = funded_view(10_000);
        let subsidy = get_block_subsidy(5, &params);

        let ok = make_block(vec![coinbase(5, subsidy + 1_000), spend(funding.clone(), 9_000)]);
        let verdict = connect_block_checks(&ok, 5, &view, &params, &checker()).unwrap();
        assert_eq!(verdict.fees, 1_000);

        let greedy = make_block(vec![coinbase(5, subsidy + 1_001), spend(funding, 9_000)]);
        let err = connect_block_checks(&greedy, 5, &view, &params, &checker()).unwrap_err();
        assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    }

    #[test]
    fn test_connect_checks_intra_block_chain_and_double_spend() {
        let params = ChainParams::regtest();
        let (view, funding) = funded_view(10_000);
        let parent = spend(funding.clone(), 9_000);
        let child = spend(OutPoint::new(txid(&parent), 0), 8_000);
        let chained = make_block(vec![coinbase(5, 1), parent.clone(), child]);
        assert_eq!(connect_block_checks(&chained, 5, &view, &params, &checker()).unwrap().fees, 2_000);

        // child before parent
        let reversed = make_block(vec![coinbase(5, 1), spend(OutPoint::new(txid(&parent), 0), 8_000), parent]);
        assert!(connect_block_checks(&reversed, 5, &view, &params, &checker()).is_err());

        let double = make_block(vec![coinbase(5, 1), spend(funding.clone(), 1), spend(funding, 2)]);
        let err = connect_block_checks(&double, 5, &view, &params, &checker()).unwrap_err();
        assert!(err.to_string().contains("double-spends"));
    }

    #[test]
    fn test_connect_checks_missing_input_is_invalid() {
        let params = ChainParams::regtest();
        let view = UtxoSet::new();
        let block = make_block(vec![coinbase(5, 1), spend(OutPoint::new([9; 32], 0), 1)]);
        let err = connect_block_checks(&block, 5, &view, &params, &checker()).unwrap_err();
        assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    }

    #[test]
    fn test_connect_checks_script_failure() {
        let params = ChainParams::regtest();
        let mut view = UtxoSet::new();
        let outpoint = OutPoint::new([0xbb; 32], 0);
        view.add_utxo(outpoint.clone(), UtxoEntry { value: 100, script_pubkey: vec![0x00], height: 1, is_coinbase: false });
        let block = make_block(vec![coinbase(5, 1), spend(outpoint, 50)]);
        assert!(connect_block_checks(&block, 5, &view, &params, &checker()).is_err());
    }

    #[test]
    fn test_connect_checks_duplicate_coinbase_exception() {
        let mut params = ChainParams::regtest();
        let block = make_block(vec![coinbase(5, 1)]);
        let mut view = UtxoSet::new();
        view.apply_block(&block, 5).unwrap();
        assert!(connect_block_checks(&block, 6, &view, &params, &checker()).is_err());

        params.bip30_exceptions.push((6, block_hash(&block.header)));
        assert!(connect_block_checks(&block, 6, &view, &params, &checker()).is_ok());
        assert!(connect_block_checks(&block, 7, &view, &params, &checker()).is_err());
    }
}
