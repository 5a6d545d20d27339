//! Shared fixtures for the scenario tests: a regtest chain on a temporary
//! directory and helpers that build blocks and spends by hand.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chaind::chain::{BlockAcceptance, ChainState, ChainStateOptions};
use chaind::core::params::ChainParams;
use chaind::core::script;
use chaind::core::types::*;
use chaind::index::IndexFlags;
use chaind::mempool::Mempool;
use chaind::storage::MemoryStore;

pub fn regtest_params() -> ChainParams {
    let mut params = ChainParams::regtest();
    params.coinbase_maturity = 2;
    params
}

pub fn all_indexes() -> IndexFlags {
    IndexFlags { txindex: true, addressindex: true, spentindex: true, timestampindex: true }
}

pub fn open_chain(store: Arc<MemoryStore>, dir: &Path) -> ChainState {
    open_with(store, dir, ChainStateOptions::default())
}

pub fn open_with(store: Arc<MemoryStore>, dir: &Path, opts: ChainStateOptions) -> ChainState {
    ChainState::open(regtest_params(), store, dir, opts, Arc::new(AtomicBool::new(false))).unwrap()
}

/// A valid block on `parent` carrying `txs` after the coinbase. `tag`
/// separates sibling blocks built on the same parent.
pub fn block_on(chain: &ChainState, parent: &Hash256, txs: Vec<Transaction>, tag: u8) -> Block {
    let parent = chain.entry(parent).expect("parent known");
    let height = parent.height + 1;
    let params = chain.params();
    let coinbase = Transaction::new_coinbase(height, params.block_reward(height), script::script_op_true(), &[tag]);
    let mut block = Block {
        header: BlockHeader {
            version: params.signalling_version(),
            prev_hash: parent.hash,
            merkle_root: NULL_HASH,
            timestamp: parent.header.timestamp + 1,
            difficulty_target: 0,
            nonce: 0,
        },
        transactions: std::iter::once(coinbase).chain(txs).collect(),
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    block
}

/// Recompute the merkle root after editing a block's transactions.
pub fn reseal(block: &mut Block) {
    block.header.merkle_root = block.compute_merkle_root().0;
}

/// Extend `from` with `n` empty blocks. Returns their hashes.
pub fn extend(chain: &mut ChainState, mut mempool: Option<&mut Mempool>, from: Hash256, n: usize, tag: u8) -> Vec<Hash256> {
    let mut parent = from;
    let mut out = Vec::new();
    for _ in 0..n {
        let block = block_on(chain, &parent, vec![], tag);
        parent = block.hash();
        let res = chain.process_new_block(block, mempool.as_deref_mut()).unwrap();
        assert_eq!(res, BlockAcceptance::Accepted(parent));
        out.push(parent);
    }
    out
}

pub fn coinbase_of(chain: &ChainState, hash: &Hash256) -> Transaction {
    chain.get_block(hash).unwrap().unwrap().transactions[0].clone()
}

/// Spend output `vout` of `prev` to a single anyone-can-spend output,
/// leaving `fee` behind.
pub fn spend(prev: &Transaction, vout: u32, fee: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::new(prev.txid(), vout),
            script_sig: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOutput {
            amount: prev.outputs[vout as usize].amount - fee,
            script_pubkey: script::script_op_true(),
        }],
        lock_time: 0,
    }
}
