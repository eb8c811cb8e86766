//! Chain selection, reorganization and block acceptance against the
//! in-memory store.

mod common;

use common::*;
use consensus_chainstate::pow::check_proof_of_work;
use consensus_chainstate::*;
use std::sync::Arc;

#[test]
fn test_reorg_to_longer_branch() {
    init_logging();
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let g = builder.genesis();
    assert_eq!(chain.tip_hash(), g.hash);

    let a1 = builder.empty(&g, 1);
    let b1 = builder.empty(&g, 2);
    let b2 = builder.empty(&b1, 2);

    let result = chain.process_block(a1.block.clone()).unwrap();
    assert_eq!(result.acceptance, BlockAcceptance::Active);
    assert_eq!(chain.tip_hash(), a1.hash);
    assert_eq!(chain.tip_height(), 1);
    assert!(chain.utxos().contains_utxo(&a1.coinbase_outpoint()));

    // equal work: the branch seen first stays active
    let result = chain.process_block(b1.block.clone()).unwrap();
    assert_eq!(result.acceptance, BlockAcceptance::SideBranch);
    assert!(result.updates.is_empty());
    assert_eq!(chain.tip_hash(), a1.hash);
    assert!(!chain.utxos().contains_utxo(&b1.coinbase_outpoint()));

    let result = chain.process_block(b2.block.clone()).unwrap();
    assert_eq!(result.acceptance, BlockAcceptance::Active);
    assert_eq!(result.updates.len(), 1);
    let update = &result.updates[0];
    assert!(update.is_reorg());
    assert_eq!(update.fork, g.hash);
    assert_eq!(update.disconnected.iter().map(|b| b.hash).collect::<Vec<_>>(), vec![a1.hash]);
    assert_eq!(update.connected.iter().map(|b| b.hash).collect::<Vec<_>>(), vec![b1.hash, b2.hash]);

    assert_eq!(chain.tip_hash(), b2.hash);
    assert_eq!(chain.tip_height(), 2);
    assert!(!chain.utxos().contains_utxo(&a1.coinbase_outpoint()));
    assert!(chain.utxos().contains_utxo(&b1.coinbase_outpoint()));
    assert!(chain.utxos().contains_utxo(&b2.coinbase_outpoint()));
    assert_eq!(chain.hash_at(1), Some(b1.hash));
    assert!(!chain.is_active(&a1.hash));
}

#[test]
fn test_reorg_back_restores_identical_utxo_set() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let g = builder.genesis();
    let a = builder.extend(&g, 2, 1);
    for b in &a {
        chain.process_block(b.block.clone()).unwrap();
    }
    let digest_on_a = chain.utxos().digest();

    let b = builder.extend(&g, 3, 2);
    for blk in &b {
        chain.process_block(blk.block.clone()).unwrap();
    }
    assert_eq!(chain.tip_hash(), b[2].hash);

    // growing the old branch past the new one switches back
    let a3 = builder.empty(&a[1], 1);
    let a4 = builder.empty(&a3, 1);
    chain.process_block(a3.block.clone()).unwrap();
    assert_eq!(chain.tip_hash(), b[2].hash, "equal work keeps the current tip");
    let result = chain.process_block(a4.block.clone()).unwrap();
    assert!(result.updates[0].is_reorg());
    assert_eq!(chain.tip_hash(), a4.hash);

    // undo a4 and a3 by hand through a fresh view of the same store
    let mut replay = chain.utxos().clone();
    for top in [&a4, &a3] {
        let undo = chain.store().load_undo(&top.hash).unwrap().unwrap();
        replay.undo_block(&top.block, &undo).unwrap();
    }
    assert_eq!(replay.digest(), digest_on_a);
}

#[test]
fn test_best_tip_has_most_work() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let g = builder.genesis();
    let mut blocks = builder.extend(&g, 3, 1);
    blocks.extend(builder.extend(&g, 5, 2));
    blocks.extend(builder.extend(&blocks[1], 2, 3));
    for b in &blocks {
        chain.process_block(b.block.clone()).unwrap();
    }

    let best = chain
        .index()
        .nodes()
        .filter(|n| n.is_valid())
        .map(|n| n.chain_work)
        .max()
        .unwrap();
    assert_eq!(chain.tip().unwrap().chain_work, best);
    assert_eq!(chain.tip_height(), 5);
}

#[test]
fn test_coinbase_maturity_boundary() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let g = builder.genesis();
    let blocks = builder.extend(&g, 100, 1);
    for b in &blocks {
        chain.process_block(b.block.clone()).unwrap();
    }
    assert_eq!(chain.tip_height(), 100);

    let funding = blocks[0].coinbase_outpoint();
    let tx = spend(&[funding.clone()], &[49 * COIN]);

    // height 100 is one block short of maturity for a height-1 coinbase
    let early = builder.block(&blocks[98], 2, vec![tx.clone()], COIN);
    let err = chain.process_block(early.block.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    assert_eq!(chain.index().get(&early.hash).unwrap().status, BlockStatus::Invalid);

    let mature = builder.block(&blocks[99], 3, vec![tx.clone()], COIN);
    chain.process_block(mature.block.clone()).unwrap();
    assert_eq!(chain.tip_hash(), mature.hash);
    assert!(!chain.utxos().contains_utxo(&funding));
    assert!(chain.utxos().contains_utxo(&outpoint(&tx, 0)));
}

#[test]
fn test_invalid_block_poisons_descendants() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let g = builder.genesis();
    let a1 = builder.empty(&g, 1);
    let b1 = builder.empty(&g, 2);
    chain.process_block(a1.block.clone()).unwrap();
    chain.process_block(b1.block.clone()).unwrap();

    // claims one unit more than the subsidy
    let b2 = builder.block(&b1, 2, Vec::new(), 1);
    let err = chain.process_block(b2.block.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    assert_eq!(chain.tip_hash(), a1.hash);
    assert_eq!(chain.index().get(&b2.hash).unwrap().status, BlockStatus::Invalid);
    assert_eq!(chain.index().get(&b1.hash).unwrap().status, BlockStatus::FullyValidated);

    let b3 = builder.empty(&b2, 2);
    let err = chain.process_block(b3.block.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    let err = chain.process_block(b2.block.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    assert_eq!(chain.tip_hash(), a1.hash);
}

#[test]
fn test_double_spend_within_block_rejected() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let blocks = builder.extend(&builder.genesis(), 101, 1);
    for b in &blocks {
        chain.process_block(b.block.clone()).unwrap();
    }
    let funding = blocks[0].coinbase_outpoint();
    let first = spend(&[funding.clone()], &[10 * COIN]);
    let second = spend(&[funding], &[20 * COIN]);
    let tip = blocks.last().unwrap();
    let bad = builder.block(tip, 2, vec![first, second], 0);
    let err = chain.process_block(bad.block).unwrap_err();
    assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    assert_eq!(chain.tip_hash(), tip.hash);
}

#[test]
fn test_orphan_connected_when_parent_arrives() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let g = builder.genesis();
    let a1 = builder.empty(&g, 1);
    let a2 = builder.empty(&a1, 1);
    let a3 = builder.empty(&a2, 1);

    let err = chain.process_block(a3.block.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::NotYetConnectable);
    let err = chain.process_block(a2.block.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::NotYetConnectable);
    assert_eq!(chain.orphan_count(), 2);
    assert_eq!(chain.tip_hash(), g.hash);

    let result = chain.process_block(a1.block.clone()).unwrap();
    assert_eq!(result.resolved_orphans, vec![a2.hash, a3.hash]);
    assert_eq!(result.updates.len(), 3);
    assert_eq!(chain.tip_hash(), a3.hash);
    assert_eq!(chain.orphan_count(), 0);
}

#[test]
fn test_corrupted_body_does_not_poison_header() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let a1 = builder.empty(&builder.genesis(), 1);

    let mut corrupted = a1.block.clone();
    corrupted.transactions[0].outputs[0].value -= 1;
    let err = chain.process_block(corrupted).unwrap_err();
    assert_eq!(err.kind(), RejectKind::Malformed);

    let result = chain.process_block(a1.block.clone()).unwrap();
    assert_eq!(result.acceptance, BlockAcceptance::Active);
    assert_eq!(chain.tip_hash(), a1.hash);
}

#[test]
fn test_insufficient_work_rejected() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let mut bad = builder.empty(&builder.genesis(), 1).block;
    while check_proof_of_work(&bad.header, &builder.params).is_ok() {
        bad.header.nonce += 1;
    }
    let hash = consensus_chainstate::serialization::block_hash(&bad.header);
    let err = chain.process_block(bad.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::ConsensusInvalid);
    assert!(!chain.index().contains(&hash));
    assert!(chain.process_block(bad).is_err());
}

#[test]
fn test_future_block_accepted_once_time_catches_up() {
    let builder = ChainBuilder::regtest();
    let config = NodeConfig::default();
    let clock = Arc::new(FixedClock::new(builder.params.genesis_timestamp as u64 - 7200));
    let checker = ScriptChecker::standard(&config.scripts);
    let mut chain =
        ChainState::open_with(builder.params.clone(), config, MemoryStore::new(), checker, clock.clone()).unwrap();

    let a1 = builder.empty(&builder.genesis(), 1);
    assert!(chain.process_block(a1.block.clone()).is_err());
    assert!(!chain.index().contains(&a1.hash));

    clock.set(builder.params.genesis_timestamp as u64);
    chain.process_block(a1.block.clone()).unwrap();
    assert_eq!(chain.tip_hash(), a1.hash);
}

#[test]
fn test_header_before_body() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let a1 = builder.empty(&builder.genesis(), 1);

    let hash = chain.accept_header(&a1.block.header).unwrap();
    assert_eq!(hash, a1.hash);
    assert_eq!(chain.index().get(&hash).unwrap().status, BlockStatus::HeaderOnly);
    assert_eq!(chain.tip_height(), 0);

    chain.process_block(a1.block.clone()).unwrap();
    assert_eq!(chain.index().get(&hash).unwrap().status, BlockStatus::FullyValidated);
    assert_eq!(chain.tip_hash(), a1.hash);

    let again = chain.process_block(a1.block).unwrap();
    assert_eq!(again.acceptance, BlockAcceptance::AlreadyKnown);
}

#[test]
fn test_failed_reorg_keeps_current_chain() {
    init_logging();
    let builder = ChainBuilder::regtest();
    let (verifier, checker) = switchable_checker();
    let mut chain = open_chain(MemoryStore::new(), checker);
    let prefix = builder.extend(&builder.genesis(), 101, 1);
    for b in &prefix {
        chain.process_block(b.block.clone()).unwrap();
    }
    let fork = &prefix[100];

    let a1 = builder.empty(fork, 5);
    let tx = spend(&[prefix[0].coinbase_outpoint()], &[50 * COIN - 10_000]);
    let b1 = builder.block(fork, 2, vec![tx], 10_000);
    let b2 = builder.empty(&b1, 2);

    chain.process_block(a1.block.clone()).unwrap();
    let result = chain.process_block(b1.block.clone()).unwrap();
    assert_eq!(result.acceptance, BlockAcceptance::SideBranch);
    let digest = chain.utxos().digest();

    // b1's scripts no longer verify when the switch to its branch re-checks it
    verifier.reject_all();
    let err = chain.process_block(b2.block.clone()).unwrap_err();
    assert_eq!(err.kind(), RejectKind::ConsensusInvalid);

    assert_eq!(chain.tip_hash(), a1.hash);
    assert_eq!(chain.utxos().digest(), digest);
    assert_eq!(chain.index().get(&b1.hash).unwrap().status, BlockStatus::Invalid);
    assert_eq!(chain.index().get(&b2.hash).unwrap().status, BlockStatus::Invalid);
    assert!(!chain.is_halted());
    assert!(chain.take_unreported_updates().is_empty());

    let b3 = builder.empty(&b2, 2);
    assert_eq!(chain.process_block(b3.block).unwrap_err().kind(), RejectKind::ConsensusInvalid);
}

#[test]
fn test_held_blocks_dropped_when_parent_invalid() {
    let builder = ChainBuilder::regtest();
    let mut chain = chain_state(MemoryStore::new());
    let b1 = builder.empty(&builder.genesis(), 2);
    chain.process_block(b1.block.clone()).unwrap();

    // claims one unit more than the subsidy
    let b2 = builder.block(&b1, 2, Vec::new(), 1);
    let b3 = builder.empty(&b2, 2);
    let b4 = builder.empty(&b3, 2);
    chain.accept_header(&b2.block.header).unwrap();
    assert_eq!(chain.process_block(b3.block.clone()).unwrap_err().kind(), RejectKind::NotYetConnectable);
    assert_eq!(chain.process_block(b4.block.clone()).unwrap_err().kind(), RejectKind::NotYetConnectable);
    assert_eq!(chain.orphan_count(), 2);

    assert_eq!(chain.process_block(b2.block.clone()).unwrap_err().kind(), RejectKind::ConsensusInvalid);
    assert_eq!(chain.orphan_count(), 0);
    assert_eq!(chain.process_block(b3.block).unwrap_err().kind(), RejectKind::ConsensusInvalid);
    assert_eq!(chain.process_block(b4.block).unwrap_err().kind(), RejectKind::ConsensusInvalid);
    assert_eq!(chain.tip_hash(), b1.hash);
}
