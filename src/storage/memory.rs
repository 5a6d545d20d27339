use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{prefixed_key, Column, KeyValueStore, StorageError, WriteBatch, WriteOp};

/// Volatile store for tests and throwaway regtest nodes.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::DbError("memory store lock poisoned".into())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(&prefixed_key(column, key)).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(prefixed_key(column, key), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(&prefixed_key(column, key));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let data = self.data.read().map_err(poisoned)?;
        let start = prefixed_key(column, prefix);
        let strip = column.prefix().len();
        Ok(data
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .map(|(k, v)| (k[strip..].to_vec(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut data = self.data.write().map_err(poisoned)?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    data.insert(prefixed_key(*column, key), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    data.remove(&prefixed_key(*column, key));
                }
            }
        }
        Ok(())
    }

    fn clear_column(&self, column: Column) -> Result<(), StorageError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.retain(|k, _| !k.starts_with(column.prefix()));
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
