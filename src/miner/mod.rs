//! Block assembly and a CPU miner, used by `chaind generate` and tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chain::validation;
use crate::chain::{BlockAcceptance, ChainState, ChainStateError};
use crate::core::params::{MAX_BLOCK_SIZE, MAX_TXS_PER_BLOCK};
use crate::core::script;
use crate::core::types::*;
use crate::mempool::Mempool;
use crate::pow;

/// Room left in the block for the header and coinbase.
const COINBASE_RESERVE: usize = 1000;

/// Mining configuration
pub struct MinerConfig {
    /// Script the block reward is paid to
    pub script_pubkey: Vec<u8>,
    /// Bytes appended to the coinbase unlocking script
    pub coinbase_extra: Vec<u8>,
    pub max_block_size: usize,
    pub threads: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            script_pubkey: script::script_op_true(),
            coinbase_extra: b"/chaind/".to_vec(),
            max_block_size: MAX_BLOCK_SIZE,
            threads: 1,
        }
    }
}

pub struct BlockTemplate {
    pub block: Block,
    pub height: u64,
    pub fees: u64,
}

/// Build a block on the current tip, filled from `mempool` in ancestor fee
/// rate order. A transaction is only taken once all of its in-pool parents
/// are in the block.
pub fn create_block_template(
    chain: &ChainState,
    mempool: Option<&Mempool>,
    config: &MinerConfig,
) -> Result<BlockTemplate, ChainStateError> {
    let tip = chain.tip().ok_or_else(|| ChainStateError::consistency("no tip to build on"))?;
    let height = tip.height + 1;
    let params = chain.params();
    let rules = chain.next_block_rules();

    let mtp = chain.median_time_past();
    let timestamp = crate::unix_time().max(mtp + 1).max(tip.header.timestamp);
    let lock_cutoff = if rules.median_time_locktime { mtp } else { timestamp };

    let mut selected: Vec<Transaction> = Vec::new();
    let mut included: HashSet<Hash256> = HashSet::new();
    let mut fees: u64 = 0;
    let mut block_size: usize = COINBASE_RESERVE;
    let size_limit = config.max_block_size.min(MAX_BLOCK_SIZE);

    if let Some(pool) = mempool {
        for entry in pool.block_candidates() {
            if selected.len() + 1 >= MAX_TXS_PER_BLOCK {
                break;
            }
            if block_size + entry.size > size_limit {
                continue;
            }
            let parents_ready = entry
                .tx
                .inputs
                .iter()
                .all(|i| !pool.contains(&i.previous_output.txid) || included.contains(&i.previous_output.txid));
            if !parents_ready || !validation::is_final_tx(&entry.tx, height, lock_cutoff) {
                continue;
            }
            block_size += entry.size;
            fees += entry.fee;
            included.insert(entry.txid);
            selected.push(entry.tx.clone());
        }
    }

    let coinbase = Transaction::new_coinbase(
        height,
        params.block_reward(height) + fees,
        config.script_pubkey.clone(),
        &config.coinbase_extra,
    );

    let mut transactions = vec![coinbase];
    transactions.extend(selected);

    let mut block = Block {
        header: BlockHeader {
            version: params.signalling_version().max(rules.min_block_version()),
            prev_hash: tip.hash,
            merkle_root: NULL_HASH,
            timestamp,
            difficulty_target: chain.next_block_difficulty(),
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().0;

    tracing::debug!(
        "Block template at height {}: {} transaction(s), {} fees, {} bytes",
        height,
        block.transactions.len() - 1,
        fees,
        block_size
    );
    Ok(BlockTemplate { block, height, fees })
}

/// Result of a mining attempt
pub enum MineResult {
    Found(Block),
    Cancelled,
}

/// Mine a block (single-threaded)
pub fn mine_block(mut block: Block, stop: Arc<AtomicBool>) -> MineResult {
    let mut nonce: u64 = 0;
    let mut hashes: u64 = 0;
    let start = std::time::Instant::now();
    let difficulty = block.header.difficulty_target;

    tracing::debug!("⛏️  Mining on {} (difficulty: {} bits)", hex::encode(block.header.prev_hash), difficulty);

    loop {
        if stop.load(Ordering::Relaxed) {
            return MineResult::Cancelled;
        }

        block.header.nonce = nonce;
        let hash = block.hash();
        if pow::check_proof_of_work(&hash, difficulty) {
            tracing::info!(
                "⛏️  Block mined! nonce={} hash={} time={:.2}s",
                nonce,
                hex::encode(hash),
                start.elapsed().as_secs_f64(),
            );
            return MineResult::Found(block);
        }

        nonce = nonce.wrapping_add(1);
        hashes += 1;

        if hashes % 100_000 == 0 {
            // Keep the header inside the future-time window on long searches
            block.header.timestamp = block.header.timestamp.max(crate::unix_time());
        }
    }
}

/// Multi-threaded mining (splits nonce space across threads)
pub fn mine_block_parallel(block: Block, threads: usize, stop: Arc<AtomicBool>) -> MineResult {
    if threads <= 1 {
        return mine_block(block, stop);
    }

    let difficulty = block.header.difficulty_target;
    let nonce_range_size = u64::MAX / threads as u64;
    let (tx, rx) = crossbeam_channel::bounded(threads);
    let found = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let mut thread_block = block.clone();
            let stop = stop.clone();
            let found = found.clone();
            let tx = tx.clone();
            let start_nonce = i as u64 * nonce_range_size;

            std::thread::spawn(move || {
                let end_nonce = start_nonce + nonce_range_size;
                let mut nonce = start_nonce;
                while nonce < end_nonce {
                    if stop.load(Ordering::Relaxed) || found.load(Ordering::Relaxed) {
                        return;
                    }
                    thread_block.header.nonce = nonce;
                    if pow::check_proof_of_work(&thread_block.hash(), difficulty) {
                        found.store(true, Ordering::Relaxed);
                        let _ = tx.send(thread_block);
                        return;
                    }
                    nonce += 1;
                }
            })
        })
        .collect();

    drop(tx);

    let result = rx.recv();
    found.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    match result {
        Ok(block) => MineResult::Found(block),
        Err(_) => MineResult::Cancelled,
    }
}

/// Mine `count` blocks on the tip, submitting each through
/// `process_new_block`. Returns the hashes of the blocks that were accepted.
pub fn generate(
    chain: &mut ChainState,
    mut mempool: Option<&mut Mempool>,
    config: &MinerConfig,
    count: u64,
    stop: Arc<AtomicBool>,
) -> Result<Vec<Hash256>, ChainStateError> {
    let mut hashes = Vec::new();
    for _ in 0..count {
        let template = create_block_template(chain, mempool.as_deref(), config)?;
        let block = match mine_block_parallel(template.block, config.threads, stop.clone()) {
            MineResult::Found(block) => block,
            MineResult::Cancelled => break,
        };
        let hash = block.hash();
        match chain.process_new_block(block, mempool.as_deref_mut())? {
            BlockAcceptance::Accepted(_) => {
                tracing::info!("✅ Block #{} added. Hash: {}", template.height, hex::encode(hash));
                hashes.push(hash);
            }
            other => {
                tracing::warn!("Mined block {} was not accepted: {:?}", hex::encode(hash), other);
                break;
            }
        }
    }
    Ok(hashes)
}
