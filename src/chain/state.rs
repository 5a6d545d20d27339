//! The chain state: block index, coin set and active chain, and the logic
//! that selects the most-work valid chain and moves the tip onto it.
//!
//! All mutation happens through `&mut ChainState`, so a single writer is
//! enforced by the borrow checker; the node wraps it in a lock. A fatal
//! error (storage failure, missing undo data, inconsistent coin set) halts
//! the state: every later mutating call returns `ChainStateError::Halted`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_bigint::BigUint;

use crate::core::params::{ChainParams, RuleSet, MAX_BLOCK_SIZE};
use crate::core::types::{Block, BlockHeader, Hash256, OutPoint, NULL_HASH};
use crate::index::{ChainIndexes, IndexFlags};
use crate::mempool::{DisconnectedBlockTransactions, Mempool};
use crate::pow;
use crate::storage::{self, Column, FlatFileStore, KeyValueStore, WriteBatch};
use crate::unix_time;

use super::checkqueue::CheckQueue;
use super::coins::{Coin, CoinsCache, CoinsDb, CoinsError, CoinsView};
use super::error::{ChainStateError, ValidationError};
use super::index::{BlockId, BlockIndex, BlockIndexEntry, BlockIndexRecord, BlockStatus, HeaderError};
use super::notify::ValidationSignals;
use super::orphans::OrphanBlocks;
use super::sigcache::SignatureCache;
use super::undo::{self, BlockUndo, DisconnectResult};
use super::validation;
use super::versionbits::VersionBitsCache;

/// A tip older than this means we are still catching up.
const MAX_TIP_AGE: u64 = 24 * 60 * 60;

/// Ordered best first: most work, then earliest seen.
type CandidateKey = (Reverse<BigUint>, u64, BlockId);

#[derive(Debug, Clone)]
pub struct ChainStateOptions {
    /// Script verification threads, 0 checks inline
    pub script_threads: usize,
    pub check_queue_capacity: usize,
    /// Coins cache size before a forced flush
    pub coins_cache_bytes: usize,
    /// Store operations per coins flush batch
    pub db_batch_size: usize,
    pub max_orphan_blocks: usize,
    pub orphan_block_expiry: u64,
    pub sig_cache_bytes: usize,
    pub indexes: IndexFlags,
    pub reindex_chainstate: bool,
    pub stop_at_height: Option<u64>,
    pub max_block_file_size: u64,
}

impl Default for ChainStateOptions {
    fn default() -> Self {
        ChainStateOptions {
            script_threads: 0,
            check_queue_capacity: 128,
            coins_cache_bytes: 450 << 20,
            db_batch_size: 16_384,
            max_orphan_blocks: 750,
            orphan_block_expiry: 20 * 60,
            sig_cache_bytes: 32 << 20,
            indexes: IndexFlags::default(),
            reindex_chainstate: false,
            stop_at_height: None,
            max_block_file_size: 128 << 20,
        }
    }
}

/// Outcome of handing a block to `process_new_block`. Rejections come back
/// as `ChainStateError::Validation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// Stored and considered for activation
    Accepted(Hash256),
    /// Body already known
    Duplicate,
    /// Parent unknown, held until it arrives
    Orphan { missing: Hash256 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Only when the coins cache is over its limit
    IfNeeded,
    Always,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtxoStats {
    pub coins: usize,
    pub total_amount: u64,
}

pub struct ChainState {
    params: ChainParams,
    opts: ChainStateOptions,
    store: Arc<dyn KeyValueStore>,
    index: BlockIndex,
    coins: CoinsCache<CoinsDb>,
    block_files: FlatFileStore,
    undo_files: FlatFileStore,
    /// `active[h]` is the block at height `h`
    active: Vec<BlockId>,
    candidates: BTreeSet<CandidateKey>,
    orphans: OrphanBlocks,
    indexes: ChainIndexes,
    checkqueue: CheckQueue,
    sigcache: Arc<SignatureCache>,
    versionbits: VersionBitsCache,
    signals: ValidationSignals,
    interrupt: Arc<AtomicBool>,
    halted: bool,
    caught_up: AtomicBool,
    last_invalid: Option<(Hash256, ValidationError)>,
}

fn short(hash: &Hash256) -> String {
    hex::encode(&hash[..8])
}

fn header_error(e: HeaderError) -> ValidationError {
    match e {
        HeaderError::HighHash => ValidationError::malformed("high-hash"),
        HeaderError::BadGenesis => ValidationError::invalid("bad-genesis"),
        HeaderError::UnknownParent(parent) => ValidationError::orphan(vec![parent]),
        HeaderError::InvalidParent => ValidationError::invalid("bad-prevblk"),
        HeaderError::KnownInvalid => ValidationError::invalid("duplicate-invalid"),
        HeaderError::BadDifficulty { .. } => ValidationError::invalid("bad-diffbits"),
    }
}

impl ChainState {
    // ─── Startup ─────────────────────────────────────────────────────

    /// Open the chain state over `store`, with block and undo files under
    /// `blocks_dir`. Repairs an interrupted coins flush, bootstraps genesis on
    /// an empty store and activates the best known chain.
    pub fn open(
        params: ChainParams,
        store: Arc<dyn KeyValueStore>,
        blocks_dir: &Path,
        opts: ChainStateOptions,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, ChainStateError> {
        let stored_flags = IndexFlags::load(store.as_ref())?;
        if let Some(stored) = stored_flags {
            if stored != opts.indexes && !opts.reindex_chainstate {
                return Err(ChainStateError::Config(format!(
                    "index settings changed (stored {:?}, requested {:?}); restart with --reindex-chainstate",
                    stored, opts.indexes
                )));
            }
        }
        if stored_flags != Some(opts.indexes) {
            let mut batch = WriteBatch::new();
            opts.indexes.stage(&mut batch)?;
            store.write_batch(batch)?;
        }

        let mut records = Vec::new();
        for (_, value) in store.scan_prefix(Column::BlockIndex, &[])? {
            records.push(storage::decode::<BlockIndexRecord>(&value)?);
        }
        let index = BlockIndex::load(records, &params).map_err(ChainStateError::consistency)?;

        let block_files = FlatFileStore::open(blocks_dir, "blk", params.magic, opts.max_block_file_size)?;
        let undo_files = FlatFileStore::open(blocks_dir, "rev", params.magic, opts.max_block_file_size)?;
        let sigcache = Arc::new(SignatureCache::new(opts.sig_cache_bytes));
        let checkqueue = CheckQueue::new(opts.script_threads, opts.check_queue_capacity, sigcache.clone());

        let mut chain = ChainState {
            coins: CoinsCache::new(CoinsDb::new(store.clone(), opts.db_batch_size)),
            indexes: ChainIndexes::new(store.clone(), opts.indexes),
            orphans: OrphanBlocks::new(opts.max_orphan_blocks, opts.orphan_block_expiry),
            params,
            opts,
            store,
            index,
            block_files,
            undo_files,
            active: Vec::new(),
            candidates: BTreeSet::new(),
            checkqueue,
            sigcache,
            versionbits: VersionBitsCache::new(),
            signals: ValidationSignals::new(),
            interrupt,
            halted: false,
            caught_up: AtomicBool::new(false),
            last_invalid: None,
        };

        if chain.opts.reindex_chainstate {
            chain.wipe_chainstate()?;
        } else {
            chain.replay_blocks()?;
        }
        chain.load_tip()?;

        if chain.index.is_empty() {
            let genesis = chain.params.genesis_block();
            chain.accept_block(&genesis, unix_time())?;
            tracing::info!("🌱 Initialized {} chain with genesis {}", chain.params.network, short(&genesis.hash()));
        }
        chain.rebuild_candidates();

        tracing::info!(
            "💾 Loaded chain state: height={} tip={} headers={} indexes={:?}",
            chain.height().map_or(-1, |h| h as i64),
            chain.tip_hash().map_or_else(|| "none".to_string(), |h| short(&h)),
            chain.index.len(),
            chain.indexes.flags(),
        );

        chain.activate_best_chain(None)?;
        Ok(chain)
    }

    /// Rebuild `active` from the coin set's best block.
    fn load_tip(&mut self) -> Result<(), ChainStateError> {
        self.active.clear();
        let Some(best) = self.coins.best_block()? else {
            return Ok(());
        };
        let tip = self.index.lookup(&best).ok_or_else(|| {
            ChainStateError::consistency(format!("coin set tip {} is not in the block index", short(&best)))
        })?;
        let mut cur = Some(tip);
        while let Some(id) = cur {
            self.active.push(id);
            cur = self.index.entry(id).parent;
        }
        self.active.reverse();
        Ok(())
    }

    /// Finish a coins flush that was cut short: roll the old branch back with
    /// undo data to the fork, then reapply blocks up to the flush target.
    /// Reapplying tolerates coins that were already written.
    fn replay_blocks(&mut self) -> Result<(), ChainStateError> {
        let Some((new, old)) = self.coins.base().head_blocks()? else {
            return Ok(());
        };
        tracing::warn!("⚠️ Coin database flush was interrupted, replaying {} -> {}", short(&old), short(&new));

        let new_id = self
            .index
            .lookup(&new)
            .ok_or_else(|| ChainStateError::consistency(format!("replay target {} not in block index", short(&new))))?;
        let old_id = if old == NULL_HASH {
            None
        } else {
            Some(self.index.lookup(&old).ok_or_else(|| {
                ChainStateError::consistency(format!("replay origin {} not in block index", short(&old)))
            })?)
        };
        let fork = old_id.and_then(|o| self.index.last_common_ancestor(o, new_id));

        let mut cur = old_id;
        while cur != fork {
            let Some(id) = cur else { break };
            let entry = self.index.entry(id).clone();
            let block = self.read_block_at(&entry)?;
            let undo = self.read_undo(&entry)?;
            if undo::disconnect_block(&block, entry.height, &undo, &mut self.coins)? == DisconnectResult::Unclean {
                tracing::debug!("Rolled back block {} over a partially written coin set", short(&entry.hash));
            }
            cur = entry.parent;
        }

        let mut forward = Vec::new();
        let mut cur = Some(new_id);
        while cur != fork {
            let Some(id) = cur else { break };
            forward.push(id);
            cur = self.index.entry(id).parent;
        }
        for &id in forward.iter().rev() {
            let entry = self.index.entry(id).clone();
            let block = self.read_block_at(&entry)?;
            self.rollforward_block(&block, entry.height)?;
        }

        self.coins.set_best_block(Some(new));
        self.coins.flush()?;
        self.store.flush()?;
        tracing::info!("💾 Replayed {} block(s) onto the coin set", forward.len());
        Ok(())
    }

    fn rollforward_block(&mut self, block: &Block, height: u64) -> Result<(), ChainStateError> {
        for tx in &block.transactions {
            let is_coinbase = tx.is_coinbase();
            if !is_coinbase {
                for input in &tx.inputs {
                    match self.coins.spend_coin(&input.previous_output) {
                        Ok(_) | Err(CoinsError::MissingOrSpent(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                let coin = Coin { output: output.clone(), height, is_coinbase };
                self.coins.add_coin(OutPoint::new(txid, vout as u32), coin, true)?;
            }
        }
        Ok(())
    }

    /// Drop the coin set and indexes so the active chain is rebuilt from the
    /// stored block files.
    fn wipe_chainstate(&mut self) -> Result<(), ChainStateError> {
        tracing::info!("🔄 Reindexing chain state from stored blocks");
        self.coins.base().clear()?;
        self.coins = CoinsCache::new(CoinsDb::new(self.store.clone(), self.opts.db_batch_size));
        self.indexes.clear()?;
        self.index.reset_chain_valid();
        self.versionbits.clear();
        self.active.clear();
        self.write_index()?;
        Ok(())
    }

    /// Rebuild the coin set and indexes from the block files, then activate.
    pub fn reindex_chainstate(&mut self, mempool: Option<&mut Mempool>) -> Result<(), ChainStateError> {
        self.ensure_usable()?;
        let result = self.wipe_chainstate();
        self.check_fatal(result)?;
        self.rebuild_candidates();
        self.activate_best_chain(mempool)
    }

    // ─── Block Intake ────────────────────────────────────────────────

    /// Validate a header and add it to the block index.
    pub fn accept_block_header(&mut self, header: &BlockHeader, now: u64) -> Result<BlockId, ValidationError> {
        let hash = header.hash();
        if let Some(id) = self.index.lookup(&hash) {
            if self.index.entry(id).is_failed() {
                return Err(ValidationError::invalid("duplicate-invalid"));
            }
            return Ok(id);
        }

        validation::check_block_header(header, &self.params)?;
        if header.prev_hash != NULL_HASH {
            let parent = self
                .index
                .lookup(&header.prev_hash)
                .ok_or_else(|| ValidationError::orphan(vec![header.prev_hash]))?;
            let parent_entry = self.index.entry(parent);
            if parent_entry.is_failed() {
                return Err(ValidationError::invalid("bad-prevblk"));
            }
            let rules = self.versionbits.ruleset_for_child(&self.index, Some(parent), &self.params);
            validation::contextual_check_block_header(header, parent_entry, &rules, Some(now), &self.params)?;
        }

        let id = self.index.insert_header(header, &self.params).map_err(header_error)?;
        tracing::debug!("Accepted header {} at height {}", short(&hash), self.index.entry(id).height);
        Ok(id)
    }

    /// Validate a block whose parent header is known and store its body.
    /// Does not activate it.
    pub fn accept_block(&mut self, block: &Block, now: u64) -> Result<BlockId, ChainStateError> {
        let hash = block.hash();
        if self.index.get(&hash).is_some_and(|e| e.have_data()) {
            return Err(ValidationError::Duplicate.into());
        }
        let id = self.accept_block_header(&block.header, now)?;

        let entry = self.index.entry(id);
        let checked = validation::check_block(block, &self.params).and_then(|()| match entry.parent {
            Some(parent) => {
                let rules = self.versionbits.ruleset_for_child(&self.index, Some(parent), &self.params);
                let parent_mtp = self.index.entry(parent).median_time_past;
                validation::contextual_check_block(block, entry.height, parent_mtp, &rules)
            }
            None => Ok(()),
        });
        if let Err(e) = checked {
            // A mangled body says nothing about the header it came with.
            if !validation::is_mutated(block) {
                self.invalid_block_found(id, &e);
            }
            return Err(e.into());
        }

        let pos = self.block_files.append(&block.to_bytes())?;
        let linked = self.index.set_have_data(id, pos, block.transactions.len() as u32);
        for linked_id in linked {
            self.try_add_candidate(linked_id);
        }
        tracing::debug!(
            "Stored block {} at height {} (file {} offset {})",
            short(&hash),
            self.index.entry(id).height,
            pos.file,
            pos.offset
        );
        Ok(id)
    }

    /// Entry point for a block from any source: buffer it as an orphan if its
    /// parent is unknown, otherwise store it, activate the best chain and
    /// then resolve any orphans it unblocks.
    pub fn process_new_block(
        &mut self,
        block: Block,
        mut mempool: Option<&mut Mempool>,
    ) -> Result<BlockAcceptance, ChainStateError> {
        self.ensure_usable()?;
        let result = self.process_block_inner(block, mempool.as_deref_mut());
        self.check_fatal(result)
    }

    fn process_block_inner(
        &mut self,
        block: Block,
        mut mempool: Option<&mut Mempool>,
    ) -> Result<BlockAcceptance, ChainStateError> {
        let hash = block.hash();
        let now = unix_time();

        if let Some(entry) = self.index.get(&hash) {
            if entry.is_failed() {
                return Err(ValidationError::invalid("duplicate-invalid").into());
            }
            if entry.have_data() {
                return Ok(BlockAcceptance::Duplicate);
            }
        }
        if self.orphans.contains(&hash) {
            return Ok(BlockAcceptance::Duplicate);
        }

        let prev = block.header.prev_hash;
        if prev != NULL_HASH && self.index.lookup(&prev).is_none() {
            validation::check_block(&block, &self.params)?;
            if self.orphans.add(block, now) {
                tracing::debug!("📥 Block {} is an orphan, waiting for {}", short(&hash), short(&prev));
            }
            return Ok(BlockAcceptance::Orphan { missing: prev });
        }

        self.accept_block(&block, now)?;
        self.last_invalid = None;
        self.activate_inner(mempool.as_deref_mut())?;
        if let Some((bad, err)) = self.last_invalid.take() {
            if bad == hash {
                return Err(err.into());
            }
            // Stored, but an ancestor failed while activating it.
            if self.index.get(&hash).is_some_and(|e| e.is_failed()) {
                return Err(ValidationError::invalid("bad-prevblk").into());
            }
        }

        let mut resolved = vec![hash];
        let mut accepted_orphans = 0usize;
        while let Some(parent) = resolved.pop() {
            for child in self.orphans.take_children(&parent) {
                let child_hash = child.hash();
                match self.accept_block(&child, now) {
                    Ok(_) => {
                        accepted_orphans += 1;
                        resolved.push(child_hash);
                    }
                    Err(ChainStateError::Validation(e)) => {
                        tracing::warn!("❌ Orphan block {} rejected: {}", short(&child_hash), e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if accepted_orphans > 0 {
            tracing::debug!("Resolved {} orphan block(s) after {}", accepted_orphans, short(&hash));
            self.activate_inner(mempool)?;
        }
        Ok(BlockAcceptance::Accepted(hash))
    }

    // ─── Chain Selection ─────────────────────────────────────────────

    fn candidate_key(&self, id: BlockId) -> CandidateKey {
        let e = self.index.entry(id);
        (Reverse(e.chain_work.clone()), e.sequence, id)
    }

    fn try_add_candidate(&mut self, id: BlockId) {
        let e = self.index.entry(id);
        if !e.is_valid(BlockStatus::TransactionsValid) || !e.chain_linked {
            return;
        }
        if let Some(tip) = self.tip_id() {
            if e.chain_work < self.index.entry(tip).chain_work {
                return;
            }
        }
        let key = self.candidate_key(id);
        self.candidates.insert(key);
    }

    fn rebuild_candidates(&mut self) {
        self.candidates.clear();
        let ids: Vec<BlockId> = self.index.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.try_add_candidate(id);
        }
    }

    fn prune_candidates(&mut self) {
        let Some(tip) = self.tip_id() else { return };
        let tip_work = self.index.entry(tip).chain_work.clone();
        self.candidates.retain(|(Reverse(work), _, _)| *work >= tip_work);
    }

    /// Best candidate whose whole branch down to the active chain is still
    /// usable. Candidates found unusable are dropped.
    fn find_most_work_chain(&mut self) -> Option<BlockId> {
        loop {
            let first = self.candidates.first()?.clone();
            let id = first.2;
            let mut usable = true;
            let mut cur = Some(id);
            while let Some(c) = cur {
                if self.is_active(c) {
                    break;
                }
                let e = self.index.entry(c);
                if e.is_failed() || !e.have_data() {
                    usable = false;
                    break;
                }
                cur = e.parent;
            }
            if usable {
                return Some(id);
            }
            self.candidates.remove(&first);
        }
    }

    /// Move the tip to the most-work valid chain, one step at a time. The
    /// tip only changes for strictly more work. Stops early when the
    /// interrupt flag is raised, always on a whole-block boundary.
    pub fn activate_best_chain(&mut self, mut mempool: Option<&mut Mempool>) -> Result<(), ChainStateError> {
        self.ensure_usable()?;
        let result = self.activate_inner(mempool.as_deref_mut());
        self.check_fatal(result)
    }

    fn activate_inner(&mut self, mut mempool: Option<&mut Mempool>) -> Result<(), ChainStateError> {
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                tracing::debug!("Chain activation interrupted at height {:?}", self.height());
                return Ok(());
            }
            let Some(best) = self.find_most_work_chain() else {
                return Ok(());
            };
            if let Some(tip) = self.tip_id() {
                if best == tip || self.index.entry(best).chain_work <= self.index.entry(tip).chain_work {
                    return Ok(());
                }
            }

            self.activate_step(best, mempool.as_deref_mut())?;
            self.prune_candidates();

            if let Some(tip) = self.tip_id() {
                let entry = self.index.entry(tip);
                tracing::info!(
                    "⛓️ Tip {} height={} work={} txs={}",
                    short(&entry.hash),
                    entry.height,
                    entry.chain_work,
                    entry.tx_count
                );
                self.signals.tip_updated(entry);
            }
            let mode = if self.is_initial_block_download() { FlushMode::IfNeeded } else { FlushMode::Always };
            self.flush_state(mode)?;
        }
    }

    /// Disconnect to the fork with `target`, then connect towards it. If a
    /// block on the way turns out invalid and the chain we got to has no
    /// more work than the one we left, the old chain is restored.
    fn activate_step(&mut self, target: BlockId, mut mempool: Option<&mut Mempool>) -> Result<(), ChainStateError> {
        let old_tip = self.tip_id();
        let fork = old_tip.and_then(|t| self.index.last_common_ancestor(t, target));
        let fork_len = fork.map_or(0, |f| self.index.entry(f).height as usize + 1);
        let old_suffix: Vec<BlockId> = self.active[fork_len.min(self.active.len())..].to_vec();
        let mut disconnected = DisconnectedBlockTransactions::new();

        if !old_suffix.is_empty() {
            tracing::info!(
                "🔄 Reorg: disconnecting {} block(s) to fork at height {} for {}",
                old_suffix.len(),
                fork_len as i64 - 1,
                short(&self.index.entry(target).hash)
            );
            if old_suffix.len() as u64 > self.params.max_reorg_depth {
                tracing::warn!("⚠️ Reorg of {} blocks exceeds the expected maximum depth", old_suffix.len());
            }
        }
        while self.active.len() > fork_len {
            self.disconnect_tip(&mut disconnected)?;
        }

        let mut path = Vec::new();
        let mut cur = Some(target);
        while let Some(id) = cur {
            if Some(id) == fork {
                break;
            }
            path.push(id);
            cur = self.index.entry(id).parent;
        }
        path.reverse();

        let mut failed = false;
        for id in path {
            if self.interrupt.load(Ordering::SeqCst) {
                break;
            }
            match self.connect_tip(id, &mut disconnected, mempool.as_deref_mut()) {
                Ok(()) => {}
                Err(ChainStateError::Validation(e)) => {
                    self.invalid_block_found(id, &e);
                    failed = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if failed && !old_suffix.is_empty() {
            let restore = match (old_tip, self.tip_id()) {
                (Some(old), Some(now)) => self.index.entry(now).chain_work <= self.index.entry(old).chain_work,
                _ => false,
            };
            if restore {
                tracing::warn!("🔄 Reorg failed, restoring previous chain of {} block(s)", old_suffix.len());
                while self.active.len() > fork_len {
                    self.disconnect_tip(&mut disconnected)?;
                }
                for id in old_suffix {
                    match self.connect_tip(id, &mut disconnected, mempool.as_deref_mut()) {
                        Ok(()) => {}
                        Err(ChainStateError::Validation(e)) => {
                            self.invalid_block_found(id, &e);
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if let Some(pool) = mempool {
            pool.update_for_reorg(disconnected, self);
        }
        Ok(())
    }

    fn invalid_block_found(&mut self, id: BlockId, error: &ValidationError) {
        let entry = self.index.entry(id);
        let hash = entry.hash;
        tracing::warn!("❌ Block {} at height {} is invalid: {}", short(&hash), entry.height, error);
        let descendants: HashSet<BlockId> = self.index.mark_failed(id).into_iter().collect();
        self.candidates.retain(|(_, _, c)| *c != id && !descendants.contains(c));
        self.last_invalid = Some((hash, error.clone()));
    }

    // ─── Tip Changes ─────────────────────────────────────────────────

    /// Connect `id`, which must extend the tip. Consensus failures come back
    /// as `Validation` with the coin set untouched.
    fn connect_tip(
        &mut self,
        id: BlockId,
        disconnected: &mut DisconnectedBlockTransactions,
        mempool: Option<&mut Mempool>,
    ) -> Result<(), ChainStateError> {
        let entry = self.index.entry(id).clone();
        if entry.parent != self.tip_id() {
            return Err(ChainStateError::consistency(format!(
                "block {} does not extend the current tip",
                short(&entry.hash)
            )));
        }
        let block = self.read_block_at(&entry)?;

        validation::check_block(&block, &self.params)?;
        if let Some(parent) = entry.parent {
            let rules = self.versionbits.ruleset_for_child(&self.index, Some(parent), &self.params);
            let parent_entry = self.index.entry(parent);
            validation::contextual_check_block_header(&block.header, parent_entry, &rules, None, &self.params)?;
            validation::contextual_check_block(&block, entry.height, parent_entry.median_time_past, &rules)?;
        }

        let expected = entry.parent.map(|p| self.index.entry(p).hash);
        if self.coins.best_block()? != expected {
            return Err(ChainStateError::consistency(format!(
                "coin set is not at the parent of block {}",
                short(&entry.hash)
            )));
        }

        let undo = {
            let mut view = CoinsCache::new(&mut self.coins);
            let undo = validation::connect_block(&block, entry.height, &mut view, &self.params, &self.checkqueue)?;
            view.set_best_block(Some(entry.hash));
            view.flush()?;
            undo
        };

        if entry.height > 0 && entry.undo_pos.is_none() {
            let pos = self.undo_files.append(&undo.encode(&entry.hash)?)?;
            self.index.set_undo_pos(id, pos);
        }
        self.index.raise_status(id, BlockStatus::ChainValid);

        let mut batch = WriteBatch::new();
        self.indexes.connect_block(&mut batch, &block, &entry.hash, entry.height, &undo)?;
        self.indexes.stage(batch);

        self.active.push(id);
        disconnected.remove_for_block(&block.transactions);
        if let Some(pool) = mempool {
            pool.remove_for_block(&block.transactions);
        }
        self.signals.block_connected(&block, self.index.entry(id), &undo);
        tracing::debug!(
            "Connected block {} at height {} ({} txs, {} inputs spent)",
            short(&entry.hash),
            entry.height,
            block.transactions.len(),
            undo.spent_count()
        );

        if self.opts.stop_at_height == Some(entry.height) {
            tracing::info!("🛑 Reached stop height {}, requesting shutdown", entry.height);
            self.interrupt.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Disconnect the tip using its undo record. Missing or unusable undo
    /// data is fatal.
    fn disconnect_tip(&mut self, disconnected: &mut DisconnectedBlockTransactions) -> Result<(), ChainStateError> {
        let id = self
            .tip_id()
            .ok_or_else(|| ChainStateError::consistency("no tip to disconnect"))?;
        let entry = self.index.entry(id).clone();
        let block = self.read_block_at(&entry)?;
        let undo = self.read_undo(&entry)?;
        let parent_hash = entry.parent.map(|p| self.index.entry(p).hash);

        {
            let mut view = CoinsCache::new(&mut self.coins);
            if undo::disconnect_block(&block, entry.height, &undo, &mut view)? == DisconnectResult::Unclean {
                return Err(ChainStateError::consistency(format!(
                    "coin set does not match block {} being disconnected",
                    short(&entry.hash)
                )));
            }
            view.set_best_block(parent_hash);
            view.flush()?;
        }

        let mut batch = WriteBatch::new();
        self.indexes.disconnect_block(&mut batch, &block, &entry.hash, entry.height, &undo)?;
        self.indexes.stage(batch);

        self.active.pop();
        disconnected.add_for_block(&block.transactions);
        self.signals.block_disconnected(&block, &entry);
        let key = self.candidate_key(id);
        self.candidates.insert(key);
        tracing::debug!("Disconnected block {} at height {}", short(&entry.hash), entry.height);
        Ok(())
    }

    // ─── Manual Intervention ─────────────────────────────────────────

    /// Treat `hash` as invalid: disconnect it if active, flag it and its
    /// descendants, then activate the best remaining chain.
    pub fn invalidate_block(&mut self, hash: &Hash256, mut mempool: Option<&mut Mempool>) -> Result<(), ChainStateError> {
        self.ensure_usable()?;
        let id = self.index.lookup(hash).ok_or(ChainStateError::UnknownBlock(*hash))?;
        if self.index.entry(id).parent.is_none() {
            return Err(ValidationError::invalid("cannot invalidate the genesis block").into());
        }
        let result = self.invalidate_inner(id, mempool.as_deref_mut());
        self.check_fatal(result)?;
        self.activate_best_chain(mempool)
    }

    fn invalidate_inner(&mut self, id: BlockId, mempool: Option<&mut Mempool>) -> Result<(), ChainStateError> {
        let mut disconnected = DisconnectedBlockTransactions::new();
        while self.is_active(id) {
            self.disconnect_tip(&mut disconnected)?;
        }
        let entry = self.index.entry(id);
        tracing::warn!("🚫 Invalidating block {} at height {}", short(&entry.hash), entry.height);
        self.index.mark_failed(id);
        self.rebuild_candidates();

        if let Some(pool) = mempool {
            pool.update_for_reorg(disconnected, self);
        }
        if let Some(tip) = self.tip_id() {
            self.signals.tip_updated(self.index.entry(tip));
        }
        self.flush_state(FlushMode::Always)
    }

    /// Clear failure flags set on `hash`, its ancestors and descendants, and
    /// let it compete for the tip again.
    pub fn reconsider_block(&mut self, hash: &Hash256, mempool: Option<&mut Mempool>) -> Result<(), ChainStateError> {
        self.ensure_usable()?;
        let id = self.index.lookup(hash).ok_or(ChainStateError::UnknownBlock(*hash))?;
        tracing::info!("Reconsidering block {} at height {}", short(hash), self.index.entry(id).height);
        self.index.clear_failure(id);
        self.rebuild_candidates();
        self.activate_best_chain(mempool)
    }

    // ─── Persistence ─────────────────────────────────────────────────

    fn write_index(&mut self) -> Result<(), ChainStateError> {
        let dirty = self.index.take_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for (hash, record) in dirty {
            batch.put(Column::BlockIndex, hash.to_vec(), storage::encode(&record)?);
        }
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Write block files, the block index and the coins cache, in that
    /// order, so the coin set never refers to data that is not durable.
    /// Pending index writes go out with the first coins batch.
    pub fn flush_state(&mut self, mode: FlushMode) -> Result<(), ChainStateError> {
        let usage = self.coins.memory_usage();
        let over_limit = usage > self.opts.coins_cache_bytes;
        if mode == FlushMode::IfNeeded && !over_limit {
            return Ok(());
        }

        self.block_files.sync()?;
        self.undo_files.sync()?;
        self.write_index()?;
        let dirty = self.coins.dirty_count();
        let staged = self.indexes.take_pending();
        self.coins.base_mut().stage(staged);
        self.coins.flush()?;
        self.store.flush()?;

        if over_limit {
            tracing::info!("💾 Flushed {} coin changes ({} KiB cache)", dirty, usage >> 10);
        } else {
            tracing::debug!("Flushed {} coin changes", dirty);
        }
        Ok(())
    }

    /// Flush everything, used at shutdown.
    pub fn flush(&mut self) -> Result<(), ChainStateError> {
        if self.halted {
            return Err(ChainStateError::Halted);
        }
        let result = self.flush_state(FlushMode::Always);
        self.check_fatal(result)
    }

    // ─── Verification ────────────────────────────────────────────────

    /// Check the last `check_blocks` blocks (0 = all) of the active chain.
    ///
    /// Level 0 reads bodies, 1 re-runs the context-free checks, 2 reads undo
    /// records, 3 disconnects on a scratch view and checks the result is
    /// clean, 4 reconnects those blocks. Returns how many blocks were checked.
    pub fn verify_db(&self, check_level: u32, check_blocks: u64) -> Result<u64, ChainStateError> {
        let Some(tip) = self.tip_id() else {
            return Ok(0);
        };
        let tip_height = self.index.entry(tip).height;
        let depth = if check_blocks == 0 { tip_height } else { check_blocks.min(tip_height) };
        let level = check_level.min(4);
        tracing::info!("🔍 Verifying last {} block(s) at level {}", depth, level);

        let mut view = CoinsCache::new(&self.coins);
        let mut disconnect_ok = level >= 3;
        let mut lowest_disconnected: Option<BlockId> = None;
        let mut cur = tip;
        let mut checked = 0u64;

        while checked < depth {
            if self.interrupt.load(Ordering::SeqCst) {
                return Ok(checked);
            }
            let entry = self.index.entry(cur);
            let Some(parent) = entry.parent else { break };
            let block = self.read_block_at(entry)?;

            if level >= 1 {
                validation::check_block(&block, &self.params).map_err(|e| {
                    ChainStateError::consistency(format!(
                        "block {} at height {} fails checks: {}",
                        short(&entry.hash),
                        entry.height,
                        e
                    ))
                })?;
            }
            if level >= 2 {
                let undo = self.read_undo(entry)?;
                if disconnect_ok && view.memory_usage() + self.coins.memory_usage() > self.opts.coins_cache_bytes {
                    tracing::debug!("Coin cache limit reached, stopping disconnect checks at height {}", entry.height);
                    disconnect_ok = false;
                }
                if disconnect_ok {
                    if undo::disconnect_block(&block, entry.height, &undo, &mut view)? == DisconnectResult::Unclean {
                        return Err(ChainStateError::consistency(format!(
                            "inconsistent undo data for block {} at height {}",
                            short(&entry.hash),
                            entry.height
                        )));
                    }
                    view.set_best_block(Some(self.index.entry(parent).hash));
                    lowest_disconnected = Some(cur);
                }
            }
            checked += 1;
            cur = parent;
        }

        if level >= 4 && disconnect_ok {
            if let Some(lowest) = lowest_disconnected {
                let from = self.index.entry(lowest).height as usize;
                for &id in &self.active[from..] {
                    let entry = self.index.entry(id);
                    let block = self.read_block_at(entry)?;
                    validation::connect_block(&block, entry.height, &mut view, &self.params, &self.checkqueue)
                        .map_err(|e| {
                            ChainStateError::consistency(format!(
                                "block {} at height {} failed to reconnect: {}",
                                short(&entry.hash),
                                entry.height,
                                e
                            ))
                        })?;
                }
            }
        }

        tracing::info!("✅ Verified {} block(s)", checked);
        Ok(checked)
    }

    // ─── Block Data ──────────────────────────────────────────────────

    fn read_block_at(&self, entry: &BlockIndexEntry) -> Result<Block, ChainStateError> {
        let pos = entry.data_pos.ok_or_else(|| {
            ChainStateError::consistency(format!("no data stored for block {}", short(&entry.hash)))
        })?;
        let bytes = self.block_files.read(pos)?;
        let block = Block::from_bytes(&bytes, MAX_BLOCK_SIZE).map_err(|e| {
            ChainStateError::consistency(format!("stored block {} does not decode: {}", short(&entry.hash), e))
        })?;
        if block.hash() != entry.hash {
            return Err(ChainStateError::consistency(format!(
                "stored block at height {} does not match index entry {}",
                entry.height,
                short(&entry.hash)
            )));
        }
        Ok(block)
    }

    fn read_undo(&self, entry: &BlockIndexEntry) -> Result<BlockUndo, ChainStateError> {
        let pos = entry.undo_pos.ok_or_else(|| {
            ChainStateError::consistency(format!(
                "missing undo data for block {} at height {}",
                short(&entry.hash),
                entry.height
            ))
        })?;
        let bytes = self.undo_files.read(pos)?;
        BlockUndo::decode(&bytes, &entry.hash).map_err(|e| {
            ChainStateError::consistency(format!("undo data for block {} unusable: {}", short(&entry.hash), e))
        })
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        match self.index.get(hash) {
            Some(entry) if entry.have_data() => Ok(Some(self.read_block_at(entry)?)),
            _ => Ok(None),
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn tip_id(&self) -> Option<BlockId> {
        self.active.last().copied()
    }

    fn is_active(&self, id: BlockId) -> bool {
        let height = self.index.entry(id).height as usize;
        self.active.get(height) == Some(&id)
    }

    pub fn tip(&self) -> Option<&BlockIndexEntry> {
        self.tip_id().map(|id| self.index.entry(id))
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.tip().map(|e| e.hash)
    }

    pub fn height(&self) -> Option<u64> {
        self.tip().map(|e| e.height)
    }

    pub fn entry(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.index.get(hash)
    }

    pub fn block_index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn hash_at_height(&self, height: u64) -> Option<Hash256> {
        self.active.get(height as usize).map(|&id| self.index.entry(id).hash)
    }

    /// Whether `hash` is on the active chain.
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.lookup(hash).is_some_and(|id| self.is_active(id))
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainStateError> {
        Ok(self.coins.get_coin(outpoint)?)
    }

    /// The coin set at the tip, for mempool validation.
    pub fn coins(&self) -> &CoinsCache<CoinsDb> {
        &self.coins
    }

    /// Every unspent coin at the tip, in outpoint order.
    pub fn all_coins(&self) -> Result<Vec<(OutPoint, Coin)>, ChainStateError> {
        let mut coins: BTreeMap<OutPoint, Coin> = self.coins.base().all_coins()?.into_iter().collect();
        for (outpoint, entry) in self.coins.entries() {
            match &entry.coin {
                Some(coin) => {
                    coins.insert(*outpoint, coin.clone());
                }
                None => {
                    coins.remove(outpoint);
                }
            }
        }
        Ok(coins.into_iter().collect())
    }

    pub fn utxo_stats(&self) -> Result<UtxoStats, ChainStateError> {
        let coins = self.all_coins()?;
        Ok(UtxoStats {
            coins: coins.len(),
            total_amount: coins.iter().map(|(_, c)| c.output.amount).sum(),
        })
    }

    /// Hashes from the tip back to genesis, dense for the first ten and
    /// doubling the step after that.
    pub fn locator(&self) -> Vec<Hash256> {
        let mut out = Vec::new();
        let Some(tip) = self.height() else {
            return out;
        };
        let mut height = tip as i64;
        let mut step = 1i64;
        while height > 0 {
            if let Some(hash) = self.hash_at_height(height as u64) {
                out.push(hash);
            }
            if out.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        if let Some(genesis) = self.hash_at_height(0) {
            out.push(genesis);
        }
        out
    }

    /// Rules in force for a block built on the current tip.
    pub fn next_block_rules(&self) -> RuleSet {
        self.versionbits.ruleset_for_child(&self.index, self.tip_id(), &self.params)
    }

    /// Difficulty a block built on the current tip must carry.
    pub fn next_block_difficulty(&self) -> u32 {
        match self.tip() {
            Some(tip) => pow::milli_to_bits(tip.next_difficulty_milli, &self.params),
            None => self.params.initial_difficulty,
        }
    }

    pub fn median_time_past(&self) -> u64 {
        self.tip().map_or(0, |t| t.median_time_past)
    }

    pub fn is_initial_block_download(&self) -> bool {
        if self.caught_up.load(Ordering::Relaxed) {
            return false;
        }
        match self.tip() {
            Some(tip) if tip.header.timestamp + MAX_TIP_AGE >= unix_time() => {
                tracing::info!("Leaving initial block download at height {}", tip.height);
                self.caught_up.store(true, Ordering::Relaxed);
                false
            }
            _ => true,
        }
    }

    pub fn sigcache(&self) -> &Arc<SignatureCache> {
        &self.sigcache
    }

    pub fn indexes(&self) -> &ChainIndexes {
        &self.indexes
    }

    pub fn signals_mut(&mut self) -> &mut ValidationSignals {
        &mut self.signals
    }

    pub fn orphan_block_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn expire_orphans(&mut self, now: u64) -> usize {
        self.orphans.expire(now)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    // ─── Fatal Errors ────────────────────────────────────────────────

    fn ensure_usable(&self) -> Result<(), ChainStateError> {
        if self.halted {
            Err(ChainStateError::Halted)
        } else {
            Ok(())
        }
    }

    fn check_fatal<T>(&mut self, result: Result<T, ChainStateError>) -> Result<T, ChainStateError> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.halted {
                tracing::error!("❌ Fatal chain state error: {}. Refusing further changes.", e);
                self.halted = true;
                self.interrupt.store(true, Ordering::SeqCst);
            }
        }
        result
    }
}
