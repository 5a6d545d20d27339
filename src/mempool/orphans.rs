//! Transactions whose inputs reference transactions we have not seen.

use std::collections::{HashMap, HashSet};

use crate::core::params::MAX_TX_SIZE;
use crate::core::types::{Hash256, Transaction};

/// Larger orphans are refused outright.
pub const MAX_ORPHAN_TX_SIZE: usize = MAX_TX_SIZE / 10;

struct OrphanTx {
    tx: Transaction,
    added: u64,
}

pub struct OrphanPool {
    txs: HashMap<Hash256, OrphanTx>,
    /// Parent txid -> orphans spending one of its outputs
    by_parent: HashMap<Hash256, HashSet<Hash256>>,
    max_txs: usize,
    expiry_secs: u64,
}

impl OrphanPool {
    pub fn new(max_txs: usize, expiry_secs: u64) -> Self {
        OrphanPool { txs: HashMap::new(), by_parent: HashMap::new(), max_txs, expiry_secs }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.txs.contains_key(txid)
    }

    /// Hold `tx` until its parents show up. Returns false if it is refused.
    pub fn add(&mut self, tx: Transaction, now: u64) -> bool {
        if self.max_txs == 0 || tx.size() > MAX_ORPHAN_TX_SIZE {
            return false;
        }
        let txid = tx.txid();
        if self.txs.contains_key(&txid) {
            return false;
        }

        self.expire(now);
        while self.txs.len() >= self.max_txs {
            let Some(oldest) = self.txs.iter().min_by_key(|(_, o)| o.added).map(|(h, _)| *h) else {
                break;
            };
            self.remove(&oldest);
        }

        for input in &tx.inputs {
            self.by_parent.entry(input.previous_output.txid).or_default().insert(txid);
        }
        self.txs.insert(txid, OrphanTx { tx, added: now });
        true
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let orphan = self.txs.remove(txid)?;
        for input in &orphan.tx.inputs {
            let parent = input.previous_output.txid;
            if let Some(waiting) = self.by_parent.get_mut(&parent) {
                waiting.remove(txid);
                if waiting.is_empty() {
                    self.by_parent.remove(&parent);
                }
            }
        }
        Some(orphan.tx)
    }

    /// Remove and return every orphan spending an output of `parent`.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Transaction> {
        let Some(waiting) = self.by_parent.get(parent) else {
            return Vec::new();
        };
        let mut ids: Vec<Hash256> = waiting.iter().copied().collect();
        ids.sort();
        ids.iter().filter_map(|txid| self.remove(txid)).collect()
    }

    /// Drop orphans confirmed by `txs` or conflicting with them.
    pub fn remove_for_block(&mut self, txs: &[Transaction]) -> usize {
        let mut doomed = HashSet::new();
        for tx in txs {
            doomed.insert(tx.txid());
            if tx.is_coinbase() {
                continue;
            }
            let spent: HashSet<_> = tx.inputs.iter().map(|i| i.previous_output).collect();
            for input in &tx.inputs {
                if let Some(waiting) = self.by_parent.get(&input.previous_output.txid) {
                    for txid in waiting {
                        let conflicts = self.txs.get(txid).is_some_and(|o| {
                            o.tx.inputs.iter().any(|i| spent.contains(&i.previous_output))
                        });
                        if conflicts {
                            doomed.insert(*txid);
                        }
                    }
                }
            }
        }
        doomed.iter().filter(|txid| self.remove(txid).is_some()).count()
    }

    pub fn expire(&mut self, now: u64) -> usize {
        let stale: Vec<Hash256> = self
            .txs
            .iter()
            .filter(|(_, o)| o.added + self.expiry_secs < now)
            .map(|(h, _)| *h)
            .collect();
        for txid in &stale {
            self.remove(txid);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script;
    use crate::core::types::{OutPoint, TxInput, TxOutput, SEQUENCE_FINAL};

    fn spend(prev: Hash256, vout: u32, amount: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput { previous_output: OutPoint::new(prev, vout), script_sig: vec![], sequence: SEQUENCE_FINAL }],
            outputs: vec![TxOutput { amount, script_pubkey: script::script_op_true() }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_take_children() {
        let mut pool = OrphanPool::new(10, 1200);
        let a = spend([1u8; 32], 0, 1);
        let b = spend([1u8; 32], 1, 2);
        assert!(pool.add(a.clone(), 0));
        assert!(!pool.add(a.clone(), 0));
        assert!(pool.add(b, 0));

        assert_eq!(pool.take_children(&[1u8; 32]).len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_limit_and_expiry() {
        let mut pool = OrphanPool::new(2, 100);
        let first = spend([1u8; 32], 0, 1);
        pool.add(first.clone(), 10);
        pool.add(spend([2u8; 32], 0, 1), 20);
        pool.add(spend([3u8; 32], 0, 1), 30);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&first.txid()));

        assert_eq!(pool.expire(125), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_for_block_drops_conflicts() {
        let mut pool = OrphanPool::new(10, 1200);
        let orphan = spend([1u8; 32], 0, 1);
        let unrelated = spend([1u8; 32], 1, 1);
        pool.add(orphan.clone(), 0);
        pool.add(unrelated.clone(), 0);

        let confirmed = spend([1u8; 32], 0, 5);
        assert_eq!(pool.remove_for_block(&[confirmed]), 1);
        assert!(!pool.contains(&orphan.txid()));
        assert!(pool.contains(&unrelated.txid()));
    }
}
