//! Spent output index: outpoint to the input that spent it.

use serde::{Deserialize, Serialize};

use crate::chain::coins::coin_key;
use crate::core::types::{Hash256, OutPoint};
use crate::storage::{self, Column, StorageError, WriteBatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentInfo {
    pub txid: Hash256,
    pub input_index: u32,
    pub height: u64,
    pub amount: u64,
}

pub fn put(batch: &mut WriteBatch, outpoint: &OutPoint, info: &SpentInfo) -> Result<(), StorageError> {
    batch.put(Column::SpentIndex, coin_key(outpoint), storage::encode(info)?);
    Ok(())
}

pub fn delete(batch: &mut WriteBatch, outpoint: &OutPoint) {
    batch.delete(Column::SpentIndex, coin_key(outpoint));
}
