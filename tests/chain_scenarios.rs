mod common;

use std::sync::Arc;

use chaind::chain::{BlockAcceptance, ChainStateError, ChainStateOptions, ValidationError};
use chaind::core::params::COIN;
use chaind::core::types::{Hash256, OutPoint};
use chaind::mempool::{Mempool, MempoolOptions};
use chaind::storage::{Column, KeyValueStore, MemoryStore};
use common::*;
use proptest::prelude::*;

#[test]
fn linear_chain_of_five() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
    let genesis = chain.params().genesis_hash();
    let blocks = extend(&mut chain, None, genesis, 5, 1);

    assert_eq!(chain.height(), Some(5));
    assert_eq!(chain.tip_hash(), Some(blocks[4]));
    for (i, hash) in blocks.iter().enumerate() {
        assert_eq!(chain.hash_at_height(i as u64 + 1), Some(*hash));
    }

    // Every coinbase so far claims exactly the subsidy.
    let stats = chain.utxo_stats().unwrap();
    assert_eq!(stats.coins, 6);
    assert_eq!(stats.total_amount, 6 * 50 * COIN);
}

#[test]
fn two_block_reorg_returns_transactions_to_mempool() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
    let mut pool = Mempool::new(MempoolOptions::default());
    let genesis = chain.params().genesis_hash();
    let a = extend(&mut chain, Some(&mut pool), genesis, 3, 1);

    let funding = coinbase_of(&chain, &a[0]);
    let tx = spend(&funding, 0, 10_000);
    pool.accept_transaction(tx.clone(), &chain, chaind::unix_time()).unwrap();

    let a4 = block_on(&chain, &a[2], vec![tx.clone()], 1);
    let a4_hash = a4.hash();
    chain.process_new_block(a4, Some(&mut pool)).unwrap();
    assert!(pool.is_empty());
    assert!(chain.get_coin(&OutPoint::new(tx.txid(), 0)).unwrap().is_some());

    let b = extend(&mut chain, Some(&mut pool), a[2], 1, 2);
    assert_eq!(chain.tip_hash(), Some(a4_hash), "equal work keeps the first seen tip");

    let b = [b[0], extend(&mut chain, Some(&mut pool), b[0], 1, 2)[0]];
    assert_eq!(chain.tip_hash(), Some(b[1]));
    assert!(!chain.contains(&a4_hash));

    assert!(pool.contains(&tx.txid()));
    assert!(chain.get_coin(&OutPoint::new(tx.txid(), 0)).unwrap().is_none());
    assert!(chain.get_coin(&OutPoint::new(funding.txid(), 0)).unwrap().is_some());
}

#[test]
fn double_spend_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
    let genesis = chain.params().genesis_hash();
    let a = extend(&mut chain, None, genesis, 3, 1);
    let funding = coinbase_of(&chain, &a[0]);

    let first = spend(&funding, 0, 1_000);
    let second = spend(&funding, 0, 2_000);

    let both = block_on(&chain, &a[2], vec![first.clone(), second.clone()], 1);
    let both_hash = both.hash();
    let err = chain.process_new_block(both, None).unwrap_err();
    assert!(matches!(err, ChainStateError::Validation(_)));
    assert_eq!(chain.tip_hash(), Some(a[2]));
    assert!(chain.entry(&both_hash).unwrap().is_failed());

    let good = block_on(&chain, &a[2], vec![first], 2);
    let good_hash = good.hash();
    chain.process_new_block(good, None).unwrap();
    assert_eq!(chain.tip_hash(), Some(good_hash));

    let late = block_on(&chain, &good_hash, vec![second], 2);
    assert!(chain.process_new_block(late, None).is_err());
    assert_eq!(chain.tip_hash(), Some(good_hash));
    assert!(!chain.is_halted());
}

#[test]
fn failed_reorg_falls_back_to_old_tip() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
    let genesis = chain.params().genesis_hash();
    let a = extend(&mut chain, None, genesis, 2, 1);
    let before = chain.utxo_stats().unwrap();

    let b1 = block_on(&chain, &genesis, vec![], 2);
    let b1_hash = b1.hash();
    chain.process_new_block(b1, None).unwrap();

    let mut b2 = block_on(&chain, &b1_hash, vec![], 2);
    b2.transactions[0].outputs[0].amount += 1;
    reseal(&mut b2);
    let b2_hash = b2.hash();
    chain.process_new_block(b2, None).unwrap();
    assert_eq!(chain.tip_hash(), Some(a[1]));

    let b3 = block_on(&chain, &b2_hash, vec![], 2);
    let b3_hash = b3.hash();
    let err = chain.process_new_block(b3, None).unwrap_err();
    assert!(!err.is_fatal());
    assert!(
        matches!(&err, ChainStateError::Validation(ValidationError::ContextuallyInvalid(r)) if r == "bad-prevblk"),
        "unexpected {:?}",
        err
    );

    assert_eq!(chain.tip_hash(), Some(a[1]));
    assert!(chain.entry(&b2_hash).unwrap().is_failed());
    assert!(chain.entry(&b3_hash).unwrap().is_failed());
    assert!(!chain.entry(&b1_hash).unwrap().is_failed());
    assert_eq!(chain.utxo_stats().unwrap(), before);
    assert!(!chain.is_halted());
}

#[test]
fn resubmitting_a_block_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
    let genesis = chain.params().genesis_hash();
    let a = extend(&mut chain, None, genesis, 3, 1);
    let before = chain.all_coins().unwrap();

    let again = chain.get_block(&a[1]).unwrap().unwrap();
    assert_eq!(chain.process_new_block(again, None).unwrap(), BlockAcceptance::Duplicate);
    assert_eq!(chain.tip_hash(), Some(a[2]));
    assert_eq!(chain.all_coins().unwrap(), before);
}

#[test]
fn orphan_blocks_connect_when_parent_arrives() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut source = open_chain(Arc::new(MemoryStore::new()), src_dir.path());
    let genesis = source.params().genesis_hash();
    let hashes = extend(&mut source, None, genesis, 3, 1);
    let blocks: Vec<_> = hashes.iter().map(|h| source.get_block(h).unwrap().unwrap()).collect();

    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
    assert_eq!(
        chain.process_new_block(blocks[2].clone(), None).unwrap(),
        BlockAcceptance::Orphan { missing: hashes[1] }
    );
    assert_eq!(
        chain.process_new_block(blocks[1].clone(), None).unwrap(),
        BlockAcceptance::Orphan { missing: hashes[0] }
    );
    assert_eq!(chain.orphan_block_count(), 2);

    chain.process_new_block(blocks[0].clone(), None).unwrap();
    assert_eq!(chain.tip_hash(), Some(hashes[2]));
    assert_eq!(chain.orphan_block_count(), 0);
}

#[test]
fn interrupted_flush_is_replayed_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let (blocks, stats) = {
        let mut chain = open_chain(store.clone(), dir.path());
        let genesis = chain.params().genesis_hash();
        let blocks = extend(&mut chain, None, genesis, 5, 1);
        chain.flush().unwrap();
        (blocks, chain.utxo_stats().unwrap())
    };

    // Leave the store as a crash between coin batches would: no best block,
    // only the (new, old) marker.
    let mut marker = blocks[4].to_vec();
    marker.extend_from_slice(&blocks[2]);
    store.delete(Column::Meta, b"best_block").unwrap();
    store.put(Column::Meta, b"head_blocks", &marker).unwrap();

    let chain = open_chain(store, dir.path());
    assert_eq!(chain.tip_hash(), Some(blocks[4]));
    assert_eq!(chain.utxo_stats().unwrap(), stats);
    assert!(chain.coins().base().head_blocks().unwrap().is_none());
}

#[test]
fn missing_undo_data_halts_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
    let genesis = chain.params().genesis_hash();
    extend(&mut chain, None, genesis, 2, 1);

    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let is_undo = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("rev"));
        if is_undo {
            std::fs::remove_file(path).unwrap();
        }
    }

    let b1 = block_on(&chain, &genesis, vec![], 2);
    let mut parent = b1.hash();
    chain.process_new_block(b1, None).unwrap();
    let b2 = block_on(&chain, &parent, vec![], 2);
    parent = b2.hash();
    chain.process_new_block(b2, None).unwrap();

    let b3 = block_on(&chain, &parent, vec![], 2);
    let err = chain.process_new_block(b3.clone(), None).unwrap_err();
    assert!(err.is_fatal());
    assert!(chain.is_halted());
    assert!(matches!(chain.process_new_block(b3, None), Err(ChainStateError::Halted)));
}

#[test]
fn indexes_follow_reorgs() {
    let dir = tempfile::tempdir().unwrap();
    let opts = ChainStateOptions { indexes: all_indexes(), ..ChainStateOptions::default() };
    let mut chain = open_with(Arc::new(MemoryStore::new()), dir.path(), opts);
    let mut pool = Mempool::new(MempoolOptions::default());
    let genesis = chain.params().genesis_hash();
    let a = extend(&mut chain, Some(&mut pool), genesis, 3, 1);

    let funding = coinbase_of(&chain, &a[0]);
    let funding_out = OutPoint::new(funding.txid(), 0);
    let tx = spend(&funding, 0, 1_000);
    let a4 = block_on(&chain, &a[2], vec![tx.clone()], 1);
    let a4_hash = a4.hash();
    chain.process_new_block(a4, Some(&mut pool)).unwrap();

    let loc = chain.indexes().tx_location(&tx.txid()).unwrap().unwrap();
    assert_eq!((loc.block_hash, loc.height, loc.position), (a4_hash, 4, 1));
    assert_eq!(chain.indexes().spent_info(&funding_out).unwrap().unwrap().txid, tx.txid());

    extend(&mut chain, Some(&mut pool), a[2], 2, 2);
    assert!(chain.indexes().tx_location(&tx.txid()).unwrap().is_none());
    assert!(chain.indexes().spent_info(&funding_out).unwrap().is_none());
    assert!(pool.contains(&tx.txid()));

    let tip = chain.tip_hash().unwrap();
    let b6 = block_on(&chain, &tip, vec![tx.clone()], 2);
    let b6_hash = b6.hash();
    chain.process_new_block(b6, Some(&mut pool)).unwrap();
    let loc = chain.indexes().tx_location(&tx.txid()).unwrap().unwrap();
    assert_eq!((loc.block_hash, loc.height), (b6_hash, 6));
    assert!(pool.is_empty());
}

#[test]
fn unflushed_index_writes_do_not_survive_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let opts = ChainStateOptions { indexes: all_indexes(), ..ChainStateOptions::default() };
    let (flushed, unflushed, tx) = {
        let mut chain = open_with(store.clone(), dir.path(), opts.clone());
        let genesis = chain.params().genesis_hash();
        let a = extend(&mut chain, None, genesis, 2, 1);
        chain.flush().unwrap();

        let b = extend(&mut chain, None, a[1], 1, 1);
        let tx = spend(&coinbase_of(&chain, &a[0]), 0, 1_000);
        let block = block_on(&chain, &b[0], vec![tx.clone()], 1);
        chain.process_new_block(block, None).unwrap();
        assert_eq!(chain.height(), Some(4));
        assert!(chain.indexes().tx_location(&tx.txid()).unwrap().is_some());
        (coinbase_of(&chain, &a[1]), coinbase_of(&chain, &b[0]), tx)
        // Dropped without a flush.
    };

    let chain = open_with(store, dir.path(), opts);
    assert_eq!(chain.height(), Some(2));
    let loc = chain.indexes().tx_location(&flushed.txid()).unwrap().unwrap();
    assert_eq!(loc.height, 2);
    assert!(chain.indexes().tx_location(&unflushed.txid()).unwrap().is_none());
    assert!(chain.indexes().tx_location(&tx.txid()).unwrap().is_none());
    assert!(chain.indexes().spent_info(&tx.inputs[0].previous_output).unwrap().is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Disconnecting a run of blocks restores the coin set exactly, and
    /// reconnecting it restores the later one.
    #[test]
    fn connect_disconnect_round_trip(spends_per_block in proptest::collection::vec(0usize..3, 1..5)) {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = open_chain(Arc::new(MemoryStore::new()), dir.path());
        let genesis = chain.params().genesis_hash();
        let base = extend(&mut chain, None, genesis, 3, 1);
        let coins_before = chain.all_coins().unwrap();

        let mut spendable = vec![coinbase_of(&chain, &base[0]), coinbase_of(&chain, &base[1])];
        let mut parent: Hash256 = base[2];
        let mut first_new = None;
        for count in spends_per_block {
            let mut txs = Vec::new();
            for _ in 0..count.min(spendable.len()) {
                if let Some(prev) = spendable.pop() {
                    txs.push(spend(&prev, 0, 100));
                }
            }
            let block = block_on(&chain, &parent, txs.clone(), 3);
            parent = block.hash();
            first_new.get_or_insert(parent);
            prop_assert_eq!(chain.process_new_block(block, None).unwrap(), BlockAcceptance::Accepted(parent));
            spendable.extend(txs);
        }
        let coins_after = chain.all_coins().unwrap();

        let first_new = first_new.unwrap();
        chain.invalidate_block(&first_new, None).unwrap();
        prop_assert_eq!(chain.tip_hash(), Some(base[2]));
        prop_assert_eq!(chain.all_coins().unwrap(), coins_before);

        chain.reconsider_block(&first_new, None).unwrap();
        prop_assert_eq!(chain.tip_hash(), Some(parent));
        prop_assert_eq!(chain.all_coins().unwrap(), coins_after);
    }
}
