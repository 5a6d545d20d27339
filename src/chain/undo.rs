//! Undo records: the coins a block spent, in the order it spent them, so the
//! block can be disconnected without a full rescan.

use serde::{Deserialize, Serialize};

use crate::core::script;
use crate::core::types::{Block, Hash256, OutPoint};
use crate::crypto;
use crate::storage::{self, StorageError};

use super::coins::{Coin, CoinsCache, CoinsError, CoinsView};
use super::error::ChainStateError;

/// Coins spent by one transaction, one per input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// One `TxUndo` per non-coinbase transaction, in block order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn spent_count(&self) -> usize {
        self.txs.iter().map(|t| t.spent.len()).sum()
    }

    /// Serialized record followed by a checksum bound to the block hash.
    pub fn encode(&self, block_hash: &Hash256) -> Result<Vec<u8>, StorageError> {
        let mut bytes = storage::encode(self)?;
        let checksum = checksum(block_hash, &bytes);
        bytes.extend_from_slice(&checksum);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8], block_hash: &Hash256) -> Result<Self, StorageError> {
        if bytes.len() < 32 {
            return Err(StorageError::Corrupt("undo record truncated".into()));
        }
        let (payload, stored) = bytes.split_at(bytes.len() - 32);
        if checksum(block_hash, payload)[..] != *stored {
            return Err(StorageError::Corrupt(format!(
                "undo checksum mismatch for block {}",
                hex::encode(block_hash)
            )));
        }
        storage::decode(payload)
    }
}

fn checksum(block_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut buf = Vec::with_capacity(32 + payload.len());
    buf.extend_from_slice(block_hash);
    buf.extend_from_slice(payload);
    crypto::double_sha256(&buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    Clean,
    /// The view did not hold exactly what the block created; it was
    /// repaired as far as possible
    Unclean,
}

/// Reverse a block's effect on `view` using its undo record.
///
/// Transactions are undone last to first, each one removing the outputs it
/// created and restoring the coins it spent.
pub fn disconnect_block<B: CoinsView>(
    block: &Block,
    height: u64,
    undo: &BlockUndo,
    view: &mut CoinsCache<B>,
) -> Result<DisconnectResult, ChainStateError> {
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ChainStateError::consistency(format!(
            "undo record has {} entries for {} transactions",
            undo.txs.len(),
            block.transactions.len()
        )));
    }

    let mut clean = true;
    for (i, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if script::is_unspendable(&output.script_pubkey) {
                continue;
            }
            match view.spend_coin(&OutPoint::new(txid, vout as u32)) {
                Ok(coin) => {
                    if coin.output != *output || coin.height != height || coin.is_coinbase != tx.is_coinbase() {
                        clean = false;
                    }
                }
                Err(CoinsError::MissingOrSpent(_)) => clean = false,
                Err(e) => return Err(e.into()),
            }
        }

        if i == 0 {
            continue;
        }
        let tx_undo = &undo.txs[i - 1];
        if tx_undo.spent.len() != tx.inputs.len() {
            return Err(ChainStateError::consistency(format!(
                "undo for tx {} has {} coins for {} inputs",
                hex::encode(txid),
                tx_undo.spent.len(),
                tx.inputs.len()
            )));
        }
        for (input, coin) in tx.inputs.iter().zip(&tx_undo.spent).rev() {
            match view.add_coin(input.previous_output, coin.clone(), false) {
                Ok(()) => {}
                Err(CoinsError::Duplicate(op)) => {
                    clean = false;
                    view.add_coin(op, coin.clone(), true)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(if clean { DisconnectResult::Clean } else { DisconnectResult::Unclean })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::coins::CoinsDb;
    use crate::core::types::{Transaction, TxInput, TxOutput};
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn coin(amount: u64, height: u64) -> Coin {
        Coin {
            output: TxOutput { amount, script_pubkey: script::script_op_true() },
            height,
            is_coinbase: false,
        }
    }

    fn setup() -> (CoinsCache<CoinsDb>, OutPoint, Block) {
        let mut view = CoinsCache::new(CoinsDb::new(Arc::new(MemoryStore::new()), 100));
        let funding = OutPoint::new([1u8; 32], 0);
        view.add_coin(funding, coin(100, 1), false).unwrap();

        let coinbase = Transaction::new_coinbase(5, 50, script::script_op_true(), b"");
        let spend = Transaction {
            version: 1,
            inputs: vec![TxInput { previous_output: funding, script_sig: vec![], sequence: u32::MAX }],
            outputs: vec![
                TxOutput { amount: 60, script_pubkey: script::script_op_true() },
                TxOutput { amount: 0, script_pubkey: script::script_op_return(b"memo") },
            ],
            lock_time: 0,
        };
        let block = Block {
            header: crate::core::params::ChainParams::regtest().genesis_block().header,
            transactions: vec![coinbase, spend],
        };
        (view, funding, block)
    }

    fn apply(view: &mut CoinsCache<CoinsDb>, block: &Block, height: u64) -> BlockUndo {
        let mut undo = BlockUndo::default();
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                let spent = tx
                    .inputs
                    .iter()
                    .map(|i| view.spend_coin(&i.previous_output).unwrap())
                    .collect();
                undo.txs.push(TxUndo { spent });
            }
            let txid = tx.txid();
            for (vout, out) in tx.outputs.iter().enumerate() {
                let c = Coin { output: out.clone(), height, is_coinbase: tx.is_coinbase() };
                view.add_coin(OutPoint::new(txid, vout as u32), c, false).unwrap();
            }
        }
        undo
    }

    #[test]
    fn test_disconnect_restores_view() {
        let (mut view, funding, block) = setup();
        let undo = apply(&mut view, &block, 5);
        assert_eq!(view.get_coin(&funding).unwrap(), None);

        let result = disconnect_block(&block, 5, &undo, &mut view).unwrap();
        assert_eq!(result, DisconnectResult::Clean);
        assert_eq!(view.get_coin(&funding).unwrap(), Some(coin(100, 1)));
        for tx in &block.transactions {
            assert_eq!(view.get_coin(&OutPoint::new(tx.txid(), 0)).unwrap(), None);
        }
    }

    #[test]
    fn test_disconnect_reports_unclean_view() {
        let (mut view, _, block) = setup();
        let undo = apply(&mut view, &block, 5);
        view.spend_coin(&OutPoint::new(block.transactions[1].txid(), 0)).unwrap();
        let result = disconnect_block(&block, 5, &undo, &mut view).unwrap();
        assert_eq!(result, DisconnectResult::Unclean);
    }

    #[test]
    fn test_mismatched_undo_is_fatal() {
        let (mut view, _, block) = setup();
        let err = disconnect_block(&block, 5, &BlockUndo::default(), &mut view).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_checksum_binds_block_hash() {
        let undo = BlockUndo { txs: vec![TxUndo { spent: vec![coin(1, 1)] }] };
        let bytes = undo.encode(&[1u8; 32]).unwrap();
        assert_eq!(BlockUndo::decode(&bytes, &[1u8; 32]).unwrap(), undo);
        assert!(matches!(BlockUndo::decode(&bytes, &[2u8; 32]), Err(StorageError::Corrupt(_))));
        assert!(BlockUndo::decode(&bytes[..10], &[1u8; 32]).is_err());
    }
}
