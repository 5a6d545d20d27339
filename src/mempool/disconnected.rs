//! Transactions from blocks disconnected during a reorg, held until the
//! reorg settles so they can be offered back to the mempool.

use std::collections::HashMap;

use crate::core::types::{Hash256, Transaction};

/// Default cap on the bytes held while a reorg is in progress.
pub const MAX_DISCONNECTED_POOL_BYTES: usize = 20 << 20;

/// Insertion-ordered pool. Blocks are added tip first and each block's
/// transactions last to first, so reading it back in reverse yields
/// parents before children.
pub struct DisconnectedBlockTransactions {
    txs: Vec<Option<Transaction>>,
    positions: HashMap<Hash256, usize>,
    bytes: usize,
    max_bytes: usize,
}

impl Default for DisconnectedBlockTransactions {
    fn default() -> Self {
        Self::with_limit(MAX_DISCONNECTED_POOL_BYTES)
    }
}

impl DisconnectedBlockTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        DisconnectedBlockTransactions { txs: Vec::new(), positions: HashMap::new(), bytes: 0, max_bytes }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.positions.contains_key(txid)
    }

    /// Queue the non-coinbase transactions of a block leaving the chain.
    pub fn add_for_block(&mut self, txs: &[Transaction]) {
        for tx in txs.iter().rev() {
            if tx.is_coinbase() {
                continue;
            }
            let txid = tx.txid();
            if self.positions.contains_key(&txid) {
                continue;
            }
            self.bytes += tx.size();
            self.positions.insert(txid, self.txs.len());
            self.txs.push(Some(tx.clone()));
        }

        // Over the limit the oldest entries go first: they came from the
        // highest blocks and are the most likely to be mined again.
        let mut front = 0;
        while self.bytes > self.max_bytes && front < self.txs.len() {
            if let Some(tx) = self.txs[front].take() {
                self.bytes -= tx.size();
                self.positions.remove(&tx.txid());
            }
            front += 1;
        }
    }

    /// Forget transactions that a newly connected block confirmed.
    pub fn remove_for_block(&mut self, txs: &[Transaction]) {
        if self.positions.is_empty() {
            return;
        }
        for tx in txs {
            if let Some(pos) = self.positions.remove(&tx.txid()) {
                if let Some(removed) = self.txs[pos].take() {
                    self.bytes -= removed.size();
                }
            }
        }
    }

    /// Drain the pool, parents before children.
    pub fn take_in_order(self) -> Vec<Transaction> {
        self.txs.into_iter().rev().flatten().collect()
    }
}
