//! Optional indexes kept in step with the active chain.
//!
//! Writes for connected and disconnected blocks collect in a pending batch
//! that queries read through. At flush time the chain state hands it to the
//! coin database, which commits it in the same write as the `head_blocks`
//! marker, so after a crash the stored indexes match either the old best
//! block or the replay target. Which indexes are enabled is recorded in the
//! store; changing the set requires rebuilding the chain state.

pub mod address;
pub mod spent;

use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::Arc;

use crate::chain::coins::coin_key;
use crate::chain::undo::BlockUndo;
use crate::core::script;
use crate::core::types::{Block, Hash256, OutPoint};
use crate::storage::{self, Column, KeyValueStore, StorageError, WriteBatch};

pub use address::{AddressDelta, AddressUtxo};
pub use spent::SpentInfo;

const FLAGS_KEY: &[u8] = b"index_flags";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFlags {
    pub txindex: bool,
    pub addressindex: bool,
    pub spentindex: bool,
    pub timestampindex: bool,
}

impl IndexFlags {
    pub fn any(&self) -> bool {
        self.txindex || self.addressindex || self.spentindex || self.timestampindex
    }

    pub fn load(store: &dyn KeyValueStore) -> Result<Option<Self>, StorageError> {
        match store.get(Column::Meta, FLAGS_KEY)? {
            Some(bytes) => Ok(Some(storage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn stage(&self, batch: &mut WriteBatch) -> Result<(), StorageError> {
        batch.put(Column::Meta, FLAGS_KEY.to_vec(), storage::encode(self)?);
        Ok(())
    }
}

/// Where a confirmed transaction lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLocation {
    pub block_hash: Hash256,
    pub height: u64,
    /// Position within the block
    pub position: u32,
}

fn timestamp_key(timestamp: u64, block_hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&timestamp.to_be_bytes());
    key.extend_from_slice(block_hash);
    key
}

pub struct ChainIndexes {
    flags: IndexFlags,
    store: Arc<dyn KeyValueStore>,
    /// Block writes not yet committed with a coins flush
    pending: WriteBatch,
}

impl ChainIndexes {
    pub fn new(store: Arc<dyn KeyValueStore>, flags: IndexFlags) -> Self {
        ChainIndexes { flags, store, pending: WriteBatch::new() }
    }

    pub fn flags(&self) -> IndexFlags {
        self.flags
    }

    /// Hold `ops` until the next flush. Queries see them immediately.
    pub fn stage(&mut self, ops: WriteBatch) {
        self.pending.append(ops);
    }

    pub fn take_pending(&mut self) -> WriteBatch {
        mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        match self.pending.lookup(column, key) {
            Some(value) => Ok(value.map(<[u8]>::to_vec)),
            None => self.store.get(column, key),
        }
    }

    fn scan(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let rows = self.store.scan_prefix(column, prefix)?;
        Ok(self.pending.overlay(column, prefix, rows))
    }

    /// Stage index entries for a block joining the active chain.
    pub fn connect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        block_hash: &Hash256,
        height: u64,
        undo: &BlockUndo,
    ) -> Result<(), StorageError> {
        if !self.flags.any() {
            return Ok(());
        }
        if self.flags.timestampindex {
            batch.put(Column::TimestampIndex, timestamp_key(block.header.timestamp, block_hash), Vec::new());
        }

        for (position, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            if self.flags.txindex {
                let location = TxLocation { block_hash: *block_hash, height, position: position as u32 };
                batch.put(Column::TxIndex, txid.to_vec(), storage::encode(&location)?);
            }

            if position > 0 {
                let spent_coins = &undo.txs[position - 1].spent;
                for (input_index, (input, coin)) in tx.inputs.iter().zip(spent_coins).enumerate() {
                    let prev = input.previous_output;
                    if self.flags.spentindex {
                        let info = SpentInfo { txid, input_index: input_index as u32, height, amount: coin.output.amount };
                        spent::put(batch, &prev, &info)?;
                    }
                    if self.flags.addressindex {
                        let script = &coin.output.script_pubkey;
                        let delta = AddressDelta {
                            height,
                            txid,
                            index: input_index as u32,
                            spending: true,
                            amount: -(coin.output.amount as i64),
                        };
                        address::put_delta(batch, script, &delta)?;
                        address::delete_unspent(batch, script, &prev);
                    }
                }
            }

            if self.flags.addressindex {
                for (vout, output) in tx.outputs.iter().enumerate() {
                    if script::is_unspendable(&output.script_pubkey) {
                        continue;
                    }
                    let delta = AddressDelta {
                        height,
                        txid,
                        index: vout as u32,
                        spending: false,
                        amount: output.amount as i64,
                    };
                    address::put_delta(batch, &output.script_pubkey, &delta)?;
                    let utxo = AddressUtxo { outpoint: OutPoint::new(txid, vout as u32), amount: output.amount, height };
                    address::put_unspent(batch, &output.script_pubkey, &utxo)?;
                }
            }
        }
        Ok(())
    }

    /// Stage removal of a block's entries as it leaves the active chain.
    pub fn disconnect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        block_hash: &Hash256,
        height: u64,
        undo: &BlockUndo,
    ) -> Result<(), StorageError> {
        if !self.flags.any() {
            return Ok(());
        }
        if self.flags.timestampindex {
            batch.delete(Column::TimestampIndex, timestamp_key(block.header.timestamp, block_hash));
        }

        for (position, tx) in block.transactions.iter().enumerate().rev() {
            let txid = tx.txid();
            if self.flags.txindex {
                batch.delete(Column::TxIndex, txid.to_vec());
            }

            if self.flags.addressindex {
                for (vout, output) in tx.outputs.iter().enumerate() {
                    if script::is_unspendable(&output.script_pubkey) {
                        continue;
                    }
                    let delta = AddressDelta {
                        height,
                        txid,
                        index: vout as u32,
                        spending: false,
                        amount: output.amount as i64,
                    };
                    address::delete_delta(batch, &output.script_pubkey, &delta);
                    address::delete_unspent(batch, &output.script_pubkey, &OutPoint::new(txid, vout as u32));
                }
            }

            if position == 0 {
                continue;
            }
            let spent_coins = &undo.txs[position - 1].spent;
            for (input_index, (input, coin)) in tx.inputs.iter().zip(spent_coins).enumerate() {
                let prev = input.previous_output;
                if self.flags.spentindex {
                    spent::delete(batch, &prev);
                }
                if self.flags.addressindex {
                    let script = &coin.output.script_pubkey;
                    let delta = AddressDelta {
                        height,
                        txid,
                        index: input_index as u32,
                        spending: true,
                        amount: -(coin.output.amount as i64),
                    };
                    address::delete_delta(batch, script, &delta);
                    let utxo = AddressUtxo { outpoint: prev, amount: coin.output.amount, height: coin.height };
                    address::put_unspent(batch, script, &utxo)?;
                }
            }
        }
        Ok(())
    }

    /// Drop every index entry, ahead of a rebuild.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.pending = WriteBatch::new();
        for column in [Column::TxIndex, Column::AddressUnspent, Column::AddressHistory, Column::SpentIndex, Column::TimestampIndex] {
            self.store.clear_column(column)?;
        }
        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub fn tx_location(&self, txid: &Hash256) -> Result<Option<TxLocation>, StorageError> {
        match self.get(Column::TxIndex, txid)? {
            Some(bytes) => Ok(Some(storage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn spent_info(&self, outpoint: &OutPoint) -> Result<Option<SpentInfo>, StorageError> {
        match self.get(Column::SpentIndex, &coin_key(outpoint))? {
            Some(bytes) => Ok(Some(storage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Balance changes of a script, in chain order.
    pub fn address_history(&self, script_pubkey: &[u8]) -> Result<Vec<AddressDelta>, StorageError> {
        self.scan(Column::AddressHistory, &address::script_hash(script_pubkey))?
            .into_iter()
            .map(|(_, v)| storage::decode(&v))
            .collect()
    }

    pub fn address_utxos(&self, script_pubkey: &[u8]) -> Result<Vec<AddressUtxo>, StorageError> {
        self.scan(Column::AddressUnspent, &address::script_hash(script_pubkey))?
            .into_iter()
            .map(|(_, v)| storage::decode(&v))
            .collect()
    }

    /// `(balance, total received)` from the history.
    pub fn address_balance(&self, script_pubkey: &[u8]) -> Result<(i64, u64), StorageError> {
        let mut balance = 0i64;
        let mut received = 0u64;
        for delta in self.address_history(script_pubkey)? {
            balance += delta.amount;
            if !delta.spending {
                received += delta.amount as u64;
            }
        }
        Ok((balance, received))
    }

    /// Hashes of active-chain blocks with `low <= timestamp < high`, oldest first.
    pub fn block_hashes_by_time(&self, high: u64, low: u64) -> Result<Vec<Hash256>, StorageError> {
        let mut out = Vec::new();
        for (key, _) in self.scan(Column::TimestampIndex, &[])? {
            if key.len() != 40 {
                return Err(StorageError::Corrupt("bad timestamp index key".into()));
            }
            let mut ts = [0u8; 8];
            ts.copy_from_slice(&key[..8]);
            let ts = u64::from_be_bytes(ts);
            if ts >= high {
                break;
            }
            if ts >= low {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&key[8..]);
                out.push(hash);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::coins::Coin;
    use crate::chain::undo::TxUndo;
    use crate::core::params::ChainParams;
    use crate::core::types::{Transaction, TxInput, TxOutput};
    use crate::storage::MemoryStore;

    fn all_flags() -> IndexFlags {
        IndexFlags { txindex: true, addressindex: true, spentindex: true, timestampindex: true }
    }

    fn fixture() -> (Block, BlockUndo, Vec<u8>, OutPoint) {
        let alice = script::script_p2pkh(&[0xA1; 32]);
        let bob = script::script_p2pkh(&[0xB0; 32]);
        let funding = OutPoint::new([7u8; 32], 0);
        let spend = Transaction {
            version: 1,
            inputs: vec![TxInput { previous_output: funding, script_sig: vec![], sequence: u32::MAX }],
            outputs: vec![
                TxOutput { amount: 70, script_pubkey: bob.clone() },
                TxOutput { amount: 0, script_pubkey: script::script_op_return(b"note") },
            ],
            lock_time: 0,
        };
        let mut block = ChainParams::regtest().genesis_block();
        block.header.timestamp = 5_000;
        block.transactions.push(spend);
        let undo = BlockUndo {
            txs: vec![TxUndo {
                spent: vec![Coin {
                    output: TxOutput { amount: 100, script_pubkey: alice.clone() },
                    height: 3,
                    is_coinbase: false,
                }],
            }],
        };
        (block, undo, alice, funding)
    }

    #[test]
    fn test_connect_then_disconnect() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let indexes = ChainIndexes::new(store.clone(), all_flags());
        let (block, undo, alice, funding) = fixture();
        let hash = block.hash();
        let bob = block.transactions[1].outputs[0].script_pubkey.clone();

        // alice was funded earlier
        let mut setup = WriteBatch::new();
        address::put_unspent(&mut setup, &alice, &AddressUtxo { outpoint: funding, amount: 100, height: 3 }).unwrap();
        store.write_batch(setup).unwrap();

        let mut batch = WriteBatch::new();
        indexes.connect_block(&mut batch, &block, &hash, 4, &undo).unwrap();
        store.write_batch(batch).unwrap();

        let spender = block.transactions[1].txid();
        let loc = indexes.tx_location(&spender).unwrap().unwrap();
        assert_eq!((loc.block_hash, loc.height, loc.position), (hash, 4, 1));
        let info = indexes.spent_info(&funding).unwrap().unwrap();
        assert_eq!((info.txid, info.input_index, info.amount), (spender, 0, 100));
        assert!(indexes.address_utxos(&alice).unwrap().is_empty());
        assert_eq!(indexes.address_balance(&alice).unwrap(), (-100, 0));
        assert_eq!(indexes.address_balance(&bob).unwrap(), (70, 70));
        assert_eq!(indexes.address_utxos(&bob).unwrap().len(), 1);
        assert_eq!(indexes.block_hashes_by_time(6_000, 4_000).unwrap(), vec![hash]);
        assert!(indexes.block_hashes_by_time(5_000, 0).unwrap().is_empty());

        let mut batch = WriteBatch::new();
        indexes.disconnect_block(&mut batch, &block, &hash, 4, &undo).unwrap();
        store.write_batch(batch).unwrap();

        assert_eq!(indexes.tx_location(&spender).unwrap(), None);
        assert_eq!(indexes.spent_info(&funding).unwrap(), None);
        assert!(indexes.address_history(&bob).unwrap().is_empty());
        assert_eq!(
            indexes.address_utxos(&alice).unwrap(),
            vec![AddressUtxo { outpoint: funding, amount: 100, height: 3 }]
        );
        assert!(indexes.block_hashes_by_time(u64::MAX, 0).unwrap().is_empty());
    }

    #[test]
    fn test_pending_writes_visible_before_flush() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut indexes = ChainIndexes::new(store.clone(), all_flags());
        let (block, undo, alice, funding) = fixture();
        let hash = block.hash();
        let spender = block.transactions[1].txid();

        let mut setup = WriteBatch::new();
        address::put_unspent(&mut setup, &alice, &AddressUtxo { outpoint: funding, amount: 100, height: 3 }).unwrap();
        store.write_batch(setup).unwrap();

        let mut batch = WriteBatch::new();
        indexes.connect_block(&mut batch, &block, &hash, 4, &undo).unwrap();
        indexes.stage(batch);

        assert!(store.get(Column::TxIndex, &spender).unwrap().is_none());
        assert_eq!(indexes.tx_location(&spender).unwrap().unwrap().height, 4);
        assert_eq!(indexes.spent_info(&funding).unwrap().unwrap().txid, spender);
        assert!(indexes.address_utxos(&alice).unwrap().is_empty());
        assert_eq!(indexes.block_hashes_by_time(6_000, 4_000).unwrap(), vec![hash]);

        // Disconnecting before any flush cancels out.
        let mut batch = WriteBatch::new();
        indexes.disconnect_block(&mut batch, &block, &hash, 4, &undo).unwrap();
        indexes.stage(batch);
        assert!(indexes.tx_location(&spender).unwrap().is_none());
        assert_eq!(indexes.address_utxos(&alice).unwrap().len(), 1);

        let pending = indexes.take_pending();
        assert!(!pending.is_empty());
        assert_eq!(indexes.pending_len(), 0);
        store.write_batch(pending).unwrap();
        assert!(store.get(Column::TxIndex, &spender).unwrap().is_none());
        assert!(indexes.block_hashes_by_time(u64::MAX, 0).unwrap().is_empty());
    }

    #[test]
    fn test_disabled_indexes_write_nothing() {
        let store = Arc::new(MemoryStore::new());
        let indexes = ChainIndexes::new(store.clone(), IndexFlags::default());
        let (block, undo, _, _) = fixture();
        let mut batch = WriteBatch::new();
        indexes.connect_block(&mut batch, &block, &block.hash(), 4, &undo).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_flags_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(IndexFlags::load(&store).unwrap(), None);
        let mut batch = WriteBatch::new();
        all_flags().stage(&mut batch).unwrap();
        store.write_batch(batch).unwrap();
        assert_eq!(IndexFlags::load(&store).unwrap(), Some(all_flags()));
    }
}
