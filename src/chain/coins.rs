//! Coin (UTXO) views.
//!
//! `CoinsDb` reads and writes the coin column of the store. `CoinsCache` is a
//! write-back layer over any other view; caches stack, so a block can be
//! connected against a scratch cache over the main cache and either flushed
//! into it on success or dropped on failure.
//!
//! Cache entries carry two flags:
//!   DIRTY - differs from the layer below and must be written on flush
//!   FRESH - the layer below has no unspent version, so spending it can simply
//!           forget the entry instead of writing a deletion

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use crate::core::script;
use crate::core::types::{Hash256, OutPoint, TxOutput, NULL_HASH};
use crate::storage::{self, Column, KeyValueStore, StorageError, WriteBatch};

/// An unspent output plus the context needed to validate spending it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TxOutput,
    pub height: u64,
    pub is_coinbase: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CoinsError {
    #[error("output {0} already exists and is unspent")]
    Duplicate(OutPoint),
    #[error("output {0} is missing or already spent")]
    MissingOrSpent(OutPoint),
    #[error("fresh coin {0} would overwrite an unspent coin")]
    FreshConflict(OutPoint),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// `None` marks a spent coin (tombstone)
    pub coin: Option<Coin>,
    pub dirty: bool,
    pub fresh: bool,
}

pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

pub trait CoinsView {
    /// Look up an unspent coin without populating any cache.
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// Block the view corresponds to, `None` before genesis is connected.
    fn best_block(&self) -> Result<Option<Hash256>, CoinsError>;
}

/// A view that accepts a flushed layer of changes.
pub trait CoinsBackend: CoinsView {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Option<Hash256>) -> Result<(), CoinsError>;
}

impl<T: CoinsView + ?Sized> CoinsView for &T {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        (**self).get_coin(outpoint)
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        (**self).best_block()
    }
}

impl<T: CoinsView + ?Sized> CoinsView for &mut T {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        (**self).get_coin(outpoint)
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        (**self).best_block()
    }
}

impl<T: CoinsBackend + ?Sized> CoinsBackend for &mut T {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Option<Hash256>) -> Result<(), CoinsError> {
        (**self).batch_write(changes, best_block)
    }
}

// ─── Database View ───────────────────────────────────────────────────

const BEST_BLOCK_KEY: &[u8] = b"best_block";
const HEAD_BLOCKS_KEY: &[u8] = b"head_blocks";

pub fn coin_key(outpoint: &OutPoint) -> Vec<u8> {
    // <txid(32)><vout(4, BE)>
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&outpoint.txid);
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn outpoint_from_key(key: &[u8]) -> Result<OutPoint, StorageError> {
    if key.len() != 36 {
        return Err(StorageError::SerializeError("invalid coin key length".into()));
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&key[..32]);
    let vout = u32::from_be_bytes([key[32], key[33], key[34], key[35]]);
    Ok(OutPoint { txid, vout })
}

fn read_hash(bytes: &[u8]) -> Result<Hash256, StorageError> {
    bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt("stored hash has wrong length".into()))
}

/// Coin set as persisted in the store.
///
/// Large flushes are split into several store batches. While one is in
/// progress the store holds `head_blocks = (new, old)` in place of
/// `best_block`, so a crash mid-flush is detected and repaired at startup.
pub struct CoinsDb {
    store: Arc<dyn KeyValueStore>,
    batch_size: usize,
    /// Writes that must land together with the next flush's first batch
    staged: WriteBatch,
}

impl CoinsDb {
    pub fn new(store: Arc<dyn KeyValueStore>, batch_size: usize) -> Self {
        CoinsDb { store, batch_size: batch_size.max(1), staged: WriteBatch::new() }
    }

    /// Queue `ops` to be written atomically with the `head_blocks` marker of
    /// the next `batch_write`. Anything derived from the coin set's tip goes
    /// here, so it is durable exactly when the marker is and replay can
    /// treat it as already at the new tip.
    pub fn stage(&mut self, ops: WriteBatch) {
        self.staged.append(ops);
    }

    /// `(new, old)` if a flush was interrupted. `old` is `NULL_HASH` when the
    /// set was empty before it.
    pub fn head_blocks(&self) -> Result<Option<(Hash256, Hash256)>, CoinsError> {
        match self.store.get(Column::Meta, HEAD_BLOCKS_KEY)? {
            Some(bytes) if bytes.len() == 64 => Ok(Some((read_hash(&bytes[..32])?, read_hash(&bytes[32..])?))),
            Some(_) => Err(StorageError::Corrupt("bad head_blocks record".into()).into()),
            None => Ok(None),
        }
    }

    /// Every stored coin, in key order.
    pub fn all_coins(&self) -> Result<Vec<(OutPoint, Coin)>, CoinsError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Coin, &[])? {
            out.push((outpoint_from_key(&key)?, storage::decode(&value)?));
        }
        Ok(out)
    }

    /// Wipe the coin set, used by reindex-chainstate.
    pub fn clear(&self) -> Result<(), CoinsError> {
        self.store.clear_column(Column::Coin)?;
        let mut batch = WriteBatch::new();
        batch.delete(Column::Meta, BEST_BLOCK_KEY.to_vec());
        batch.delete(Column::Meta, HEAD_BLOCKS_KEY.to_vec());
        self.store.write_batch(batch)?;
        Ok(())
    }
}

impl CoinsView for CoinsDb {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        match self.store.get(Column::Coin, &coin_key(outpoint))? {
            Some(bytes) => Ok(Some(storage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.store.get(Column::Meta, BEST_BLOCK_KEY)? {
            Some(bytes) => Ok(Some(read_hash(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl CoinsBackend for CoinsDb {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Option<Hash256>) -> Result<(), CoinsError> {
        let old = match self.head_blocks()? {
            Some((_, old)) => old,
            None => self.best_block()?.unwrap_or(NULL_HASH),
        };
        let new = best_block.unwrap_or(NULL_HASH);

        let mut head = Vec::with_capacity(64);
        head.extend_from_slice(&new);
        head.extend_from_slice(&old);

        let mut batch = mem::take(&mut self.staged);
        let staged = batch.len();
        batch.delete(Column::Meta, BEST_BLOCK_KEY.to_vec());
        batch.put(Column::Meta, HEAD_BLOCKS_KEY.to_vec(), head);

        let mut written = 0usize;
        let mut batches = 1usize;
        for (outpoint, entry) in changes {
            if !entry.dirty {
                continue;
            }
            match entry.coin {
                Some(coin) => batch.put(Column::Coin, coin_key(&outpoint), storage::encode(&coin)?),
                None => batch.delete(Column::Coin, coin_key(&outpoint)),
            }
            written += 1;
            if batch.len() >= self.batch_size {
                self.store.write_batch(mem::take(&mut batch))?;
                batches += 1;
            }
        }

        batch.delete(Column::Meta, HEAD_BLOCKS_KEY.to_vec());
        if let Some(best) = best_block {
            batch.put(Column::Meta, BEST_BLOCK_KEY.to_vec(), best.to_vec());
        }
        self.store.write_batch(batch)?;

        tracing::debug!("Wrote {} coin changes and {} staged ops in {} batch(es)", written, staged, batches);
        Ok(())
    }
}

// ─── Write-back Cache ────────────────────────────────────────────────

/// Rough per-entry footprint used for cache sizing.
const APPROX_ENTRY_SIZE: usize = 128;

pub struct CoinsCache<B> {
    base: B,
    cache: CoinsMap,
    /// `None` until set locally; reads fall through to the base
    best_block: Option<Option<Hash256>>,
}

impl<B: CoinsView> CoinsCache<B> {
    pub fn new(base: B) -> Self {
        CoinsCache { base, cache: HashMap::new(), best_block: None }
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B {
        &mut self.base
    }

    /// Fetch a coin into this cache and return it if unspent.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<Option<&Coin>, CoinsError> {
        if !self.cache.contains_key(outpoint) {
            if let Some(coin) = self.base.get_coin(outpoint)? {
                self.cache.insert(*outpoint, CacheEntry { coin: Some(coin), dirty: false, fresh: false });
            }
        }
        Ok(self.cache.get(outpoint).and_then(|e| e.coin.as_ref()))
    }

    /// Add a new unspent coin. Unspendable outputs are silently skipped.
    ///
    /// Fails with `Duplicate` if an unspent coin already sits at `outpoint`,
    /// unless `possible_overwrite` is set.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) -> Result<(), CoinsError> {
        if script::is_unspendable(&coin.output.script_pubkey) {
            return Ok(());
        }
        if self.access_coin(&outpoint)?.is_some() && !possible_overwrite {
            return Err(CoinsError::Duplicate(outpoint));
        }
        let fresh = self.cache.get(&outpoint).map_or(true, |e| e.fresh);
        self.cache.insert(outpoint, CacheEntry { coin: Some(coin), dirty: true, fresh });
        Ok(())
    }

    /// Spend a coin, returning it for the undo record.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Coin, CoinsError> {
        if self.access_coin(outpoint)?.is_none() {
            return Err(CoinsError::MissingOrSpent(*outpoint));
        }
        let entry = self
            .cache
            .get_mut(outpoint)
            .ok_or(CoinsError::MissingOrSpent(*outpoint))?;
        let coin = entry.coin.take().ok_or(CoinsError::MissingOrSpent(*outpoint))?;
        entry.dirty = true;
        let forget = entry.fresh;
        if forget {
            self.cache.remove(outpoint);
        }
        Ok(coin)
    }

    /// Drop a clean cached entry, e.g. after a rejected mempool lookup.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if self.cache.get(outpoint).is_some_and(|e| !e.dirty) {
            self.cache.remove(outpoint);
        }
    }

    pub fn set_best_block(&mut self, best: Option<Hash256>) {
        self.best_block = Some(best);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.cache.values().filter(|e| e.dirty).count()
    }

    pub fn memory_usage(&self) -> usize {
        self.cache.len() * APPROX_ENTRY_SIZE
    }

    pub fn entries(&self) -> impl Iterator<Item = (&OutPoint, &CacheEntry)> {
        self.cache.iter()
    }
}

impl<B: CoinsBackend> CoinsCache<B> {
    /// Push every dirty entry into the base and empty this cache.
    pub fn flush(&mut self) -> Result<(), CoinsError> {
        let changes: CoinsMap = mem::take(&mut self.cache)
            .into_iter()
            .filter(|(_, e)| e.dirty)
            .collect();
        let best = match self.best_block {
            Some(best) => best,
            None => self.base.best_block()?,
        };
        self.base.batch_write(changes, best)
    }
}

impl<B: CoinsView> CoinsView for CoinsCache<B> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        match self.cache.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.base.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.best_block {
            Some(best) => Ok(best),
            None => self.base.best_block(),
        }
    }
}

impl<B: CoinsView> CoinsBackend for CoinsCache<B> {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Option<Hash256>) -> Result<(), CoinsError> {
        for (outpoint, child) in changes {
            if !child.dirty {
                continue;
            }
            match self.cache.get_mut(&outpoint) {
                None => {
                    // A fresh tombstone never reached any lower layer.
                    if child.coin.is_none() && child.fresh {
                        continue;
                    }
                    self.cache.insert(outpoint, CacheEntry { coin: child.coin, dirty: true, fresh: child.fresh });
                }
                Some(ours) => {
                    if child.fresh && ours.coin.is_some() {
                        return Err(CoinsError::FreshConflict(outpoint));
                    }
                    let forget = ours.fresh && child.coin.is_none();
                    ours.coin = child.coin;
                    ours.dirty = true;
                    if forget {
                        self.cache.remove(&outpoint);
                    }
                }
            }
        }
        self.best_block = Some(best_block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn coin(amount: u64) -> Coin {
        Coin {
            output: TxOutput { amount, script_pubkey: script::script_op_true() },
            height: 1,
            is_coinbase: false,
        }
    }

    fn op(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    fn db() -> (Arc<MemoryStore>, CoinsDb) {
        let store = Arc::new(MemoryStore::new());
        let db = CoinsDb::new(store.clone(), 1000);
        (store, db)
    }

    #[test]
    fn test_add_then_spend_fresh_never_touches_db() {
        let (store, db) = db();
        let mut cache = CoinsCache::new(db);
        cache.add_coin(op(1), coin(5), false).unwrap();
        assert_eq!(cache.spend_coin(&op(1)).unwrap(), coin(5));
        assert_eq!(cache.cache_len(), 0);
        cache.set_best_block(Some([9u8; 32]));
        cache.flush().unwrap();
        assert!(cache.base().all_coins().unwrap().is_empty());
        assert_eq!(store.scan_prefix(Column::Coin, &[]).unwrap().len(), 0);
    }

    #[test]
    fn test_duplicate_and_missing() {
        let (_, db) = db();
        let mut cache = CoinsCache::new(db);
        cache.add_coin(op(1), coin(5), false).unwrap();
        assert!(matches!(cache.add_coin(op(1), coin(6), false), Err(CoinsError::Duplicate(_))));
        cache.add_coin(op(1), coin(6), true).unwrap();
        assert_eq!(cache.get_coin(&op(1)).unwrap(), Some(coin(6)));

        cache.spend_coin(&op(1)).unwrap();
        assert!(matches!(cache.spend_coin(&op(1)), Err(CoinsError::MissingOrSpent(_))));
        assert!(matches!(cache.spend_coin(&op(2)), Err(CoinsError::MissingOrSpent(_))));
    }

    #[test]
    fn test_unspendable_outputs_are_skipped() {
        let (_, db) = db();
        let mut cache = CoinsCache::new(db);
        let burn = Coin {
            output: TxOutput { amount: 1, script_pubkey: script::script_op_return(b"x") },
            height: 1,
            is_coinbase: false,
        };
        cache.add_coin(op(1), burn, false).unwrap();
        assert_eq!(cache.get_coin(&op(1)).unwrap(), None);
    }

    #[test]
    fn test_spend_of_persisted_coin_writes_deletion() {
        let (_, db) = db();
        let mut cache = CoinsCache::new(db);
        cache.add_coin(op(1), coin(5), false).unwrap();
        cache.set_best_block(Some([1u8; 32]));
        cache.flush().unwrap();
        assert_eq!(cache.base().all_coins().unwrap().len(), 1);

        cache.spend_coin(&op(1)).unwrap();
        assert_eq!(cache.dirty_count(), 1);
        cache.set_best_block(Some([2u8; 32]));
        cache.flush().unwrap();
        assert!(cache.base().all_coins().unwrap().is_empty());
        assert_eq!(cache.base().best_block().unwrap(), Some([2u8; 32]));
    }

    #[test]
    fn test_get_coin_does_not_populate() {
        let (_, db) = db();
        let mut cache = CoinsCache::new(db);
        cache.add_coin(op(1), coin(5), false).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.get_coin(&op(1)).unwrap(), Some(coin(5)));
        assert_eq!(cache.cache_len(), 0);
        assert!(cache.access_coin(&op(1)).unwrap().is_some());
        assert_eq!(cache.cache_len(), 1);
        cache.uncache(&op(1));
        assert_eq!(cache.cache_len(), 0);
    }

    #[test]
    fn test_scratch_layer_discarded_on_drop() {
        let (_, db) = db();
        let mut main = CoinsCache::new(db);
        main.add_coin(op(1), coin(5), false).unwrap();
        {
            let mut scratch = CoinsCache::new(&mut main);
            scratch.spend_coin(&op(1)).unwrap();
            scratch.add_coin(op(2), coin(7), false).unwrap();
        }
        assert_eq!(main.get_coin(&op(1)).unwrap(), Some(coin(5)));
        assert_eq!(main.get_coin(&op(2)).unwrap(), None);
    }

    #[test]
    fn test_scratch_layer_flushes_into_parent() {
        let (_, db) = db();
        let mut main = CoinsCache::new(db);
        main.add_coin(op(1), coin(5), false).unwrap();
        main.flush().unwrap();
        main.add_coin(op(3), coin(9), false).unwrap();
        {
            let mut scratch = CoinsCache::new(&mut main);
            scratch.spend_coin(&op(1)).unwrap();
            scratch.spend_coin(&op(3)).unwrap();
            scratch.add_coin(op(2), coin(7), false).unwrap();
            scratch.set_best_block(Some([4u8; 32]));
            scratch.flush().unwrap();
        }
        assert_eq!(main.get_coin(&op(1)).unwrap(), None);
        assert_eq!(main.get_coin(&op(2)).unwrap(), Some(coin(7)));
        // op(3) was fresh in main, so its spend leaves nothing behind
        assert!(main.entries().all(|(o, _)| *o != op(3)));
        assert_eq!(main.best_block().unwrap(), Some([4u8; 32]));

        main.flush().unwrap();
        let coins = main.base().all_coins().unwrap();
        assert_eq!(coins, vec![(op(2), coin(7))]);
    }

    #[test]
    fn test_chunked_flush_clears_head_marker() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(CoinsDb::new(store.clone(), 2));
        for n in 0..10 {
            cache.add_coin(op(n), coin(n as u64 + 1), false).unwrap();
        }
        cache.set_best_block(Some([8u8; 32]));
        cache.flush().unwrap();
        assert_eq!(cache.base().head_blocks().unwrap(), None);
        assert_eq!(cache.base().best_block().unwrap(), Some([8u8; 32]));
        assert_eq!(cache.base().all_coins().unwrap().len(), 10);
    }

    /// Accepts `writes` batches, then fails every later one.
    struct CrashingStore {
        inner: MemoryStore,
        writes: std::sync::atomic::AtomicUsize,
    }

    impl KeyValueStore for CrashingStore {
        fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(column, key)
        }
        fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
            self.inner.put(column, key, value)
        }
        fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError> {
            self.inner.delete(column, key)
        }
        fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
            self.inner.scan_prefix(column, prefix)
        }
        fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
            use std::sync::atomic::Ordering;
            if self.writes.load(Ordering::SeqCst) == 0 {
                return Err(StorageError::DbError("simulated crash".into()));
            }
            self.writes.fetch_sub(1, Ordering::SeqCst);
            self.inner.write_batch(batch)
        }
        fn clear_column(&self, column: Column) -> Result<(), StorageError> {
            self.inner.clear_column(column)
        }
        fn flush(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn test_staged_ops_land_with_head_marker() {
        let store = Arc::new(CrashingStore { inner: MemoryStore::new(), writes: 1.into() });
        let mut db = CoinsDb::new(store.clone(), 2);
        let mut ops = WriteBatch::new();
        ops.put(Column::TxIndex, b"tx".to_vec(), b"loc".to_vec());
        db.stage(ops);

        let mut cache = CoinsCache::new(db);
        for n in 0..6 {
            cache.add_coin(op(n), coin(1), false).unwrap();
        }
        cache.set_best_block(Some([3u8; 32]));
        assert!(cache.flush().is_err());

        // Only the first batch made it: staged ops and the marker together.
        assert_eq!(store.get(Column::TxIndex, b"tx").unwrap(), Some(b"loc".to_vec()));
        assert_eq!(cache.base().head_blocks().unwrap(), Some(([3u8; 32], NULL_HASH)));
        assert_eq!(cache.base().best_block().unwrap(), None);
    }

    #[test]
    fn test_staged_ops_written_once() {
        let (store, mut db) = db();
        let mut ops = WriteBatch::new();
        ops.put(Column::SpentIndex, b"k".to_vec(), b"v".to_vec());
        db.stage(ops);
        let mut cache = CoinsCache::new(db);
        cache.set_best_block(Some([1u8; 32]));
        cache.flush().unwrap();
        assert_eq!(store.get(Column::SpentIndex, b"k").unwrap(), Some(b"v".to_vec()));

        store.delete(Column::SpentIndex, b"k").unwrap();
        cache.flush().unwrap();
        assert_eq!(store.get(Column::SpentIndex, b"k").unwrap(), None);
    }

    #[test]
    fn test_interrupted_flush_leaves_head_marker() {
        let store = Arc::new(MemoryStore::new());
        let db = CoinsDb::new(store.clone(), 100);
        let mut batch = WriteBatch::new();
        let mut head = [5u8; 32].to_vec();
        head.extend_from_slice(&[4u8; 32]);
        batch.put(Column::Meta, HEAD_BLOCKS_KEY.to_vec(), head);
        store.write_batch(batch).unwrap();
        assert_eq!(db.head_blocks().unwrap(), Some(([5u8; 32], [4u8; 32])));
        assert_eq!(db.best_block().unwrap(), None);
    }
}
