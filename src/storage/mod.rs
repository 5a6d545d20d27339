//! Persistent storage: a column-keyed key/value store (sled on disk, a
//! BTreeMap in memory) plus append-only flat files for block bodies and undo
//! records.

use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub mod flatfile;
pub mod memory;

pub use flatfile::{FilePos, FlatFileStore};
pub use memory::MemoryStore;

/// Logical tables. Each maps to a key prefix inside the single sled tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    BlockIndex,
    Coin,
    Meta,
    TxIndex,
    AddressUnspent,
    AddressHistory,
    SpentIndex,
    TimestampIndex,
}

impl Column {
    pub fn prefix(self) -> &'static [u8] {
        match self {
            Column::BlockIndex => b"idx:",
            Column::Coin => b"utx:",
            Column::Meta => b"meta:",
            Column::TxIndex => b"txi:",
            Column::AddressUnspent => b"aun:",
            Column::AddressHistory => b"adh:",
            Column::SpentIndex => b"spt:",
            Column::TimestampIndex => b"tsi:",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { column: Column, key: Vec<u8>, value: Vec<u8> },
    Delete { column: Column, key: Vec<u8> },
}

/// Ordered set of writes applied atomically by `KeyValueStore::write_batch`.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put { column, key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { column, key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    /// Queue `other`'s writes after this batch's.
    pub fn append(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// The last write to `key` in this batch, `Some(None)` for a delete.
    pub fn lookup(&self, column: Column, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops.iter().rev().find_map(|op| match op {
            WriteOp::Put { column: c, key: k, value } if *c == column && k.as_slice() == key => {
                Some(Some(value.as_slice()))
            }
            WriteOp::Delete { column: c, key: k } if *c == column && k.as_slice() == key => Some(None),
            _ => None,
        })
    }

    /// Lay this batch's writes under `prefix` over `rows`, a key-ordered
    /// scan of the same column, as if the batch had been applied.
    pub fn overlay(&self, column: Column, prefix: &[u8], rows: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<(Vec<u8>, Vec<u8>)> {
        if self.ops.is_empty() {
            return rows;
        }
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = rows.into_iter().collect();
        for op in &self.ops {
            match op {
                WriteOp::Put { column: c, key, value } if *c == column && key.starts_with(prefix) => {
                    merged.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { column: c, key } if *c == column && key.starts_with(prefix) => {
                    merged.remove(key);
                }
                _ => {}
            }
        }
        merged.into_iter().collect()
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError>;
    /// All entries of `column` whose key starts with `prefix`, in key order.
    /// Returned keys have the column prefix stripped.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError>;
    /// Remove every entry of a column.
    fn clear_column(&self, column: Column) -> Result<(), StorageError>;
    /// Make all previous writes durable.
    fn flush(&self) -> Result<(), StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.as_ref().write_batch(batch)
    }

    fn clear_column(&self, column: Column) -> Result<(), StorageError> {
        self.as_ref().clear_column(column)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.as_ref().flush()
    }
}

// ─── Sled Backend ────────────────────────────────────────────────────

/// Persistent storage backend using sled embedded database
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(db_err)?;
        Ok(SledStore { db })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self.db.get(prefixed_key(column, key)).map_err(db_err)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(prefixed_key(column, key), value).map_err(db_err)?;
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError> {
        self.db.remove(prefixed_key(column, key)).map_err(db_err)?;
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let strip = column.prefix().len();
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefixed_key(column, prefix)) {
            let (key, value) = item.map_err(db_err)?;
            out.push((key[strip..].to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                WriteOp::Put { column, key, value } => sled_batch.insert(prefixed_key(column, &key), value),
                WriteOp::Delete { column, key } => sled_batch.remove(prefixed_key(column, &key)),
            }
        }
        self.db.apply_batch(sled_batch).map_err(db_err)
    }

    fn clear_column(&self, column: Column) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for item in self.db.scan_prefix(column.prefix()) {
            let (key, _) = item.map_err(db_err)?;
            sled_batch.remove(key);
        }
        self.db.apply_batch(sled_batch).map_err(db_err)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

pub(crate) fn prefixed_key(column: Column, data: &[u8]) -> Vec<u8> {
    let prefix = column.prefix();
    let mut key = Vec::with_capacity(prefix.len() + data.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(data);
    key
}

fn db_err(e: sled::Error) -> StorageError {
    StorageError::DbError(e.to_string())
}

/// Serialize a value for storage.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializeError(e.to_string()))
}

/// Deserialize a stored value.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializeError(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    DbError(String),
    SerializeError(String),
    Io(String),
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DbError(e) => write!(f, "database error: {}", e),
            StorageError::SerializeError(e) => write!(f, "serialization error: {}", e),
            StorageError::Io(e) => write!(f, "i/o error: {}", e),
            StorageError::Corrupt(e) => write!(f, "corrupt data: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}
