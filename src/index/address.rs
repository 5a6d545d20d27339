//! Address (script) index: unspent outputs and balance history per script.

use serde::{Deserialize, Serialize};

use crate::core::types::{Hash256, OutPoint};
use crate::crypto;
use crate::storage::{self, Column, StorageError, WriteBatch};

const SCRIPT_HASH_LEN: usize = 32;

pub fn script_hash(script_pubkey: &[u8]) -> Hash256 {
    crypto::double_sha256(script_pubkey)
}

/// One change to a script's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDelta {
    pub height: u64,
    pub txid: Hash256,
    /// Output index when receiving, input index when spending
    pub index: u32,
    pub spending: bool,
    /// Negative when spending
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressUtxo {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub height: u64,
}

/// `<script_hash><height BE><txid><index BE><spending>`, so a prefix scan
/// returns a script's history in chain order.
fn history_key(script_hash: &Hash256, delta: &AddressDelta) -> Vec<u8> {
    let mut key = Vec::with_capacity(SCRIPT_HASH_LEN + 8 + 32 + 4 + 1);
    key.extend_from_slice(script_hash);
    key.extend_from_slice(&delta.height.to_be_bytes());
    key.extend_from_slice(&delta.txid);
    key.extend_from_slice(&delta.index.to_be_bytes());
    key.push(delta.spending as u8);
    key
}

fn unspent_key(script_hash: &Hash256, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(SCRIPT_HASH_LEN + 36);
    key.extend_from_slice(script_hash);
    key.extend_from_slice(&outpoint.txid);
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
    key
}

pub fn put_delta(batch: &mut WriteBatch, script_pubkey: &[u8], delta: &AddressDelta) -> Result<(), StorageError> {
    let hash = script_hash(script_pubkey);
    batch.put(Column::AddressHistory, history_key(&hash, delta), storage::encode(delta)?);
    Ok(())
}

pub fn delete_delta(batch: &mut WriteBatch, script_pubkey: &[u8], delta: &AddressDelta) {
    batch.delete(Column::AddressHistory, history_key(&script_hash(script_pubkey), delta));
}

pub fn put_unspent(batch: &mut WriteBatch, script_pubkey: &[u8], utxo: &AddressUtxo) -> Result<(), StorageError> {
    let hash = script_hash(script_pubkey);
    batch.put(Column::AddressUnspent, unspent_key(&hash, &utxo.outpoint), storage::encode(utxo)?);
    Ok(())
}

pub fn delete_unspent(batch: &mut WriteBatch, script_pubkey: &[u8], outpoint: &OutPoint) {
    batch.delete(Column::AddressUnspent, unspent_key(&script_hash(script_pubkey), outpoint));
}
