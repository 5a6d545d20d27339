//! Unconfirmed transaction pool.
//!
//! Entries are validated against the chain tip plus the outputs of other
//! pool transactions. Each entry carries aggregates over its in-pool
//! ancestors and descendants, used for block assembly (ancestor fee rate)
//! and eviction (descendant fee rate). The pool follows the chain: confirmed
//! transactions and their conflicts leave on connect, and transactions from
//! disconnected blocks are offered back after a reorg.

pub mod disconnected;
pub mod orphans;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::chain::checkqueue::ScriptCheck;
use crate::chain::coins::{Coin, CoinsError, CoinsView};
use crate::chain::sigcache::CachingChecker;
use crate::chain::validation;
use crate::chain::{ChainState, ChainStateError, ValidationError};
use crate::core::types::{Hash256, OutPoint, Transaction};
use crate::storage::StorageError;

pub use disconnected::DisconnectedBlockTransactions;
pub use orphans::OrphanPool;

const MEMPOOL_DUMP_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct MempoolOptions {
    pub max_bytes: usize,
    pub expiry_secs: u64,
    /// Minimum fee per 1000 bytes
    pub min_relay_fee: u64,
    pub max_orphan_txs: usize,
    pub orphan_expiry_secs: u64,
    /// Most in-pool ancestors (including itself) a transaction may have
    pub ancestor_limit: usize,
    pub descendant_limit: usize,
}

impl Default for MempoolOptions {
    fn default() -> Self {
        MempoolOptions {
            max_bytes: 300 << 20,
            expiry_secs: 336 * 60 * 60,
            min_relay_fee: 1000,
            max_orphan_txs: 100,
            orphan_expiry_secs: 20 * 60,
            ancestor_limit: 25,
            descendant_limit: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: u64,
    pub size: usize,
    /// Arrival time
    pub time: u64,
    /// Chain height when it entered the pool
    pub height: u64,
    pub spends_coinbase: bool,
    pub ancestor_count: usize,
    pub ancestor_size: usize,
    pub ancestor_fees: u64,
    pub descendant_count: usize,
    pub descendant_size: usize,
    pub descendant_fees: u64,
}

impl MempoolEntry {
    /// Fee rate of this entry with all its in-pool ancestors, in sat per 1000 bytes.
    pub fn ancestor_fee_rate(&self) -> u64 {
        fee_rate(self.ancestor_fees, self.ancestor_size)
    }

    pub fn descendant_fee_rate(&self) -> u64 {
        fee_rate(self.descendant_fees, self.descendant_size)
    }
}

fn fee_rate(fees: u64, size: usize) -> u64 {
    ((fees as u128 * 1000) / size.max(1) as u128) as u64
}

#[derive(Serialize, Deserialize)]
struct MempoolDump {
    version: u32,
    txs: Vec<(Transaction, u64)>,
}

/// The tip's coins plus outputs created by pool transactions.
struct PoolView<'a> {
    chain: &'a ChainState,
    pool: &'a Mempool,
    height: u64,
}

impl CoinsView for PoolView<'_> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        if let Some(parent) = self.pool.entries.get(&outpoint.txid) {
            return Ok(parent
                .tx
                .outputs
                .get(outpoint.vout as usize)
                .map(|output| Coin { output: output.clone(), height: self.height, is_coinbase: false }));
        }
        self.chain.coins().get_coin(outpoint)
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        self.chain.coins().best_block()
    }
}

pub struct Mempool {
    opts: MempoolOptions,
    entries: HashMap<Hash256, MempoolEntry>,
    /// Outpoint -> pool transaction spending it
    spent: HashMap<OutPoint, Hash256>,
    parents: HashMap<Hash256, HashSet<Hash256>>,
    children: HashMap<Hash256, HashSet<Hash256>>,
    total_bytes: usize,
    orphans: OrphanPool,
}

impl Mempool {
    pub fn new(opts: MempoolOptions) -> Self {
        let orphans = OrphanPool::new(opts.max_orphan_txs, opts.orphan_expiry_secs);
        Mempool {
            opts,
            entries: HashMap::new(),
            spent: HashMap::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
            total_bytes: 0,
            orphans,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<_> = self.entries.keys().copied().collect();
        out.sort();
        out
    }

    // ─── Admission ───────────────────────────────────────────────────

    /// Validate `tx` against the tip and the pool and add it. Transactions
    /// with unknown inputs are held as orphans and reported as such; orphans
    /// waiting on `tx` are retried once it is in.
    pub fn accept_transaction(&mut self, tx: Transaction, chain: &ChainState, now: u64) -> Result<Hash256, ChainStateError> {
        let txid = tx.txid();
        match self.accept_single(tx.clone(), chain, now, false) {
            Ok(()) => {}
            Err(ChainStateError::Validation(ValidationError::Orphan { missing })) => {
                if self.orphans.add(tx, now) {
                    tracing::debug!("Holding orphan transaction {} ({} missing parents)", hex::encode(txid), missing.len());
                }
                return Err(ValidationError::orphan(missing).into());
            }
            Err(e) => return Err(e),
        }

        let mut queue = VecDeque::from([txid]);
        while let Some(parent) = queue.pop_front() {
            for orphan in self.orphans.take_children(&parent) {
                let orphan_id = orphan.txid();
                match self.accept_single(orphan.clone(), chain, now, false) {
                    Ok(()) => {
                        tracing::debug!("Accepted orphan transaction {}", hex::encode(orphan_id));
                        queue.push_back(orphan_id);
                    }
                    Err(ChainStateError::Validation(ValidationError::Orphan { .. })) => {
                        self.orphans.add(orphan, now);
                    }
                    Err(ChainStateError::Validation(e)) => {
                        tracing::debug!("Orphan transaction {} rejected: {}", hex::encode(orphan_id), e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(txid)
    }

    /// Admission of one transaction. `bypass_limits` is set when returning
    /// transactions from disconnected blocks, which skip fee and size policy.
    fn accept_single(
        &mut self,
        tx: Transaction,
        chain: &ChainState,
        now: u64,
        bypass_limits: bool,
    ) -> Result<(), ChainStateError> {
        validation::check_transaction(&tx)?;
        if tx.is_coinbase() {
            return Err(ValidationError::malformed("coinbase").into());
        }
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(ValidationError::Duplicate.into());
        }

        let next_height = chain.height().map_or(0, |h| h + 1);
        let rules = chain.next_block_rules();
        let lock_cutoff = if rules.median_time_locktime { chain.median_time_past() } else { now };
        if !validation::is_final_tx(&tx, next_height, lock_cutoff) {
            return Err(ValidationError::invalid("non-final").into());
        }

        for input in &tx.inputs {
            if let Some(conflict) = self.spent.get(&input.previous_output) {
                return Err(ValidationError::invalid(format!(
                    "txn-mempool-conflict with {}",
                    hex::encode(conflict)
                ))
                .into());
            }
        }

        let (fee, spends_coinbase) = {
            let view = PoolView { chain, pool: &*self, height: next_height };
            let mut missing = Vec::new();
            let mut spends_coinbase = false;
            for input in &tx.inputs {
                match view.get_coin(&input.previous_output)? {
                    Some(coin) => spends_coinbase |= coin.is_coinbase,
                    None => missing.push(input.previous_output.txid),
                }
            }
            if !missing.is_empty() {
                missing.sort();
                missing.dedup();
                return Err(ValidationError::orphan(missing).into());
            }
            let fee = validation::check_tx_inputs(&tx, &view, next_height, chain.params().coinbase_maturity)?;

            let shared = Arc::new(tx.clone());
            let checker = CachingChecker { cache: chain.sigcache().as_ref(), store: true };
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let prev_output = view
                    .get_coin(&input.previous_output)?
                    .ok_or_else(|| ValidationError::invalid("bad-txns-inputs-missingorspent"))?
                    .output;
                ScriptCheck { tx: shared.clone(), input_index, prev_output }
                    .run(&checker)
                    .map_err(|e| ValidationError::invalid(format!("mandatory-script-verify-flag-failed ({})", e)))?;
            }
            (fee, spends_coinbase)
        };

        let size = tx.size();
        if !bypass_limits {
            let required = self.opts.min_relay_fee.saturating_mul(size as u64) / 1000;
            if fee < required {
                return Err(ValidationError::ResourceExhausted(format!(
                    "min relay fee not met, {} < {}",
                    fee, required
                ))
                .into());
            }
        }

        let parents: HashSet<Hash256> = tx
            .inputs
            .iter()
            .map(|i| i.previous_output.txid)
            .filter(|p| self.entries.contains_key(p))
            .collect();
        let ancestors = self.collect_ancestors(&parents);
        if !bypass_limits {
            if ancestors.len() + 1 > self.opts.ancestor_limit {
                return Err(ValidationError::ResourceExhausted("too-long-mempool-chain".into()).into());
            }
            for ancestor in &ancestors {
                if self.entries.get(ancestor).is_some_and(|a| a.descendant_count + 1 > self.opts.descendant_limit) {
                    return Err(ValidationError::ResourceExhausted("too-long-mempool-chain".into()).into());
                }
            }
        }

        let entry = MempoolEntry {
            txid,
            fee,
            size,
            time: now,
            height: next_height.saturating_sub(1),
            spends_coinbase,
            ancestor_count: 1,
            ancestor_size: size,
            ancestor_fees: fee,
            descendant_count: 1,
            descendant_size: size,
            descendant_fees: fee,
            tx,
        };
        self.insert_entry(entry, parents);
        tracing::debug!("📝 Accepted tx {} (fee {}, {} bytes, {} in pool)", hex::encode(txid), fee, size, self.entries.len());

        if !bypass_limits {
            self.trim_to_size(self.opts.max_bytes);
            if !self.entries.contains_key(&txid) {
                return Err(ValidationError::ResourceExhausted("mempool full".into()).into());
            }
        }
        Ok(())
    }

    // ─── Graph Maintenance ───────────────────────────────────────────

    fn insert_entry(&mut self, entry: MempoolEntry, parents: HashSet<Hash256>) {
        let txid = entry.txid;
        for input in &entry.tx.inputs {
            self.spent.insert(input.previous_output, txid);
        }
        for parent in &parents {
            self.children.entry(*parent).or_default().insert(txid);
        }
        self.total_bytes += entry.size;
        self.entries.insert(txid, entry);
        self.parents.insert(txid, parents);

        let mut affected = self.ancestors_of(&txid);
        affected.insert(txid);
        self.refresh_aggregates(affected);
    }

    /// Remove one entry without touching its descendants. Returns the txids
    /// whose aggregates need refreshing.
    fn remove_unchecked(&mut self, txid: &Hash256) -> HashSet<Hash256> {
        let mut affected = HashSet::new();
        let Some(entry) = self.entries.remove(txid) else {
            return affected;
        };
        affected.extend(self.ancestors_of(txid));
        affected.extend(self.collect_descendants(txid));

        for input in &entry.tx.inputs {
            if self.spent.get(&input.previous_output) == Some(txid) {
                self.spent.remove(&input.previous_output);
            }
        }
        if let Some(parents) = self.parents.remove(txid) {
            for parent in parents {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.remove(txid);
                }
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(ps) = self.parents.get_mut(&child) {
                    ps.remove(txid);
                }
            }
        }
        self.total_bytes -= entry.size;
        affected.remove(txid);
        affected
    }

    /// Remove `txid` and everything that spends its outputs.
    fn remove_recursive(&mut self, txid: &Hash256) -> usize {
        if !self.entries.contains_key(txid) {
            return 0;
        }
        let mut doomed = self.collect_descendants(txid);
        doomed.insert(*txid);
        self.remove_set(&doomed)
    }

    fn remove_set(&mut self, doomed: &HashSet<Hash256>) -> usize {
        let mut affected = HashSet::new();
        let mut removed = 0;
        for txid in doomed {
            if self.entries.contains_key(txid) {
                affected.extend(self.remove_unchecked(txid));
                removed += 1;
            }
        }
        affected.retain(|t| !doomed.contains(t));
        self.refresh_aggregates(affected);
        removed
    }

    /// `parents` and all of their in-pool ancestors.
    fn collect_ancestors(&self, parents: &HashSet<Hash256>) -> HashSet<Hash256> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Hash256> = parents.iter().copied().collect();
        while let Some(cur) = queue.pop_front() {
            if !self.entries.contains_key(&cur) || !seen.insert(cur) {
                continue;
            }
            if let Some(ps) = self.parents.get(&cur) {
                queue.extend(ps.iter().copied());
            }
        }
        seen
    }

    fn ancestors_of(&self, txid: &Hash256) -> HashSet<Hash256> {
        match self.parents.get(txid) {
            Some(parents) => self.collect_ancestors(parents),
            None => HashSet::new(),
        }
    }

    fn collect_descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Hash256> = self.children.get(txid).into_iter().flatten().copied().collect();
        while let Some(cur) = queue.pop_front() {
            if !seen.insert(cur) {
                continue;
            }
            if let Some(cs) = self.children.get(&cur) {
                queue.extend(cs.iter().copied());
            }
        }
        seen
    }

    /// Recompute ancestor and descendant aggregates of `txids` from the graph.
    fn refresh_aggregates(&mut self, txids: HashSet<Hash256>) {
        for txid in txids {
            if !self.entries.contains_key(&txid) {
                continue;
            }
            let ancestors = self.ancestors_of(&txid);
            let descendants = self.collect_descendants(&txid);
            let sum = |set: &HashSet<Hash256>| {
                set.iter().filter_map(|t| self.entries.get(t)).fold((0usize, 0usize, 0u64), |acc, e| {
                    (acc.0 + 1, acc.1 + e.size, acc.2 + e.fee)
                })
            };
            let (a_count, a_size, a_fees) = sum(&ancestors);
            let (d_count, d_size, d_fees) = sum(&descendants);
            if let Some(e) = self.entries.get_mut(&txid) {
                e.ancestor_count = a_count + 1;
                e.ancestor_size = a_size + e.size;
                e.ancestor_fees = a_fees + e.fee;
                e.descendant_count = d_count + 1;
                e.descendant_size = d_size + e.size;
                e.descendant_fees = d_fees + e.fee;
            }
        }
    }

    // ─── Chain Updates ───────────────────────────────────────────────

    /// A block was connected: drop the transactions it confirmed and
    /// anything that conflicts with them.
    pub fn remove_for_block(&mut self, txs: &[Transaction]) {
        let mut affected = HashSet::new();
        let mut confirmed = 0;
        for tx in txs {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                affected.extend(self.remove_unchecked(&txid));
                confirmed += 1;
            }
        }
        affected.retain(|t| self.entries.contains_key(t));
        self.refresh_aggregates(affected);

        let conflicts = self.remove_conflicts(txs);
        let orphans = self.orphans.remove_for_block(txs);
        if confirmed + conflicts + orphans > 0 {
            tracing::debug!(
                "Block removed {} confirmed, {} conflicting and {} orphan transaction(s) from the pool",
                confirmed,
                conflicts,
                orphans
            );
        }
    }

    /// Remove pool transactions (and their descendants) that spend an
    /// input also spent by one of `txs`.
    pub fn remove_conflicts(&mut self, txs: &[Transaction]) -> usize {
        let mut removed = 0;
        for tx in txs {
            let txid = tx.txid();
            for input in &tx.inputs {
                if let Some(conflict) = self.spent.get(&input.previous_output).copied() {
                    if conflict != txid {
                        tracing::debug!("Removing {} which conflicts with {}", hex::encode(conflict), hex::encode(txid));
                        removed += self.remove_recursive(&conflict);
                    }
                }
            }
        }
        removed
    }

    /// After a reorg step: offer back the transactions of disconnected
    /// blocks, relink pool transactions that spend them, drop entries the
    /// new tip makes invalid and trim.
    pub fn update_for_reorg(&mut self, disconnected: DisconnectedBlockTransactions, chain: &ChainState) {
        let now = crate::unix_time();
        let mut readded = Vec::new();
        let mut dropped = 0usize;

        for tx in disconnected.take_in_order() {
            let txid = tx.txid();
            match self.accept_single(tx, chain, now, true) {
                Ok(()) => readded.push(txid),
                Err(e) => {
                    tracing::debug!("Not returning {} to the pool: {}", hex::encode(txid), e);
                    dropped += 1;
                    // Pool transactions built on it cannot be valid any more.
                    let spenders: Vec<Hash256> = self
                        .spent
                        .iter()
                        .filter(|(outpoint, _)| outpoint.txid == txid)
                        .map(|(_, spender)| *spender)
                        .collect();
                    for spender in spenders {
                        self.remove_recursive(&spender);
                    }
                }
            }
        }

        self.update_transactions_from_block(&readded);
        let stale = self.remove_for_reorg(chain);
        self.trim_to_size(self.opts.max_bytes);

        if !readded.is_empty() || dropped > 0 || stale > 0 {
            tracing::info!(
                "♻️ Reorg returned {} transaction(s) to the pool, dropped {}, evicted {} now-invalid",
                readded.len(),
                dropped,
                stale
            );
        }
    }

    /// Link transactions returned from disconnected blocks to pool
    /// transactions that already spend their outputs, and refresh the
    /// aggregates that changed.
    pub fn update_transactions_from_block(&mut self, txids: &[Hash256]) {
        let mut affected = HashSet::new();
        for txid in txids {
            let Some(entry) = self.entries.get(txid) else { continue };
            let outputs = entry.tx.outputs.len() as u32;
            for vout in 0..outputs {
                let Some(child) = self.spent.get(&OutPoint::new(*txid, vout)).copied() else {
                    continue;
                };
                if self.children.entry(*txid).or_default().insert(child) {
                    self.parents.entry(child).or_default().insert(*txid);
                    affected.insert(child);
                    affected.extend(self.collect_descendants(&child));
                }
            }
            affected.insert(*txid);
            affected.extend(self.ancestors_of(txid));
        }
        self.refresh_aggregates(affected);
    }

    /// Drop entries the current tip no longer allows: missing inputs,
    /// immature coinbase spends and non-final transactions.
    pub fn remove_for_reorg(&mut self, chain: &ChainState) -> usize {
        let next_height = chain.height().map_or(0, |h| h + 1);
        let rules = chain.next_block_rules();
        let maturity = chain.params().coinbase_maturity;
        let now = crate::unix_time();
        let lock_cutoff = if rules.median_time_locktime { chain.median_time_past() } else { now };

        let mut doomed = HashSet::new();
        for entry in self.entries.values() {
            if !validation::is_final_tx(&entry.tx, next_height, lock_cutoff) {
                doomed.insert(entry.txid);
                continue;
            }
            for input in &entry.tx.inputs {
                if self.entries.contains_key(&input.previous_output.txid) {
                    continue;
                }
                match chain.get_coin(&input.previous_output) {
                    Ok(Some(coin)) => {
                        if coin.is_coinbase && next_height.saturating_sub(coin.height) < maturity {
                            doomed.insert(entry.txid);
                        }
                    }
                    Ok(None) => {
                        doomed.insert(entry.txid);
                    }
                    Err(e) => {
                        tracing::warn!("Coin lookup failed while checking pool: {}", e);
                    }
                }
            }
        }

        let mut removed = 0;
        for txid in doomed {
            removed += self.remove_recursive(&txid);
        }
        removed
    }

    // ─── Limits ──────────────────────────────────────────────────────

    /// Evict packages with the lowest descendant fee rate until the pool
    /// fits in `max_bytes`.
    pub fn trim_to_size(&mut self, max_bytes: usize) -> usize {
        let mut evicted = 0;
        while self.total_bytes > max_bytes {
            let worst = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.descendant_fee_rate()
                        .cmp(&b.descendant_fee_rate())
                        .then(b.time.cmp(&a.time))
                        .then(a.txid.cmp(&b.txid))
                })
                .map(|e| e.txid);
            let Some(worst) = worst else { break };
            evicted += self.remove_recursive(&worst);
        }
        if evicted > 0 {
            tracing::debug!("Evicted {} transaction(s) to keep the pool under {} bytes", evicted, max_bytes);
        }
        evicted
    }

    /// Drop entries older than the expiry and everything depending on them.
    pub fn expire(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.opts.expiry_secs);
        let stale: Vec<Hash256> = self.entries.values().filter(|e| e.time < cutoff).map(|e| e.txid).collect();
        let mut removed = 0;
        for txid in stale {
            removed += self.remove_recursive(&txid);
        }
        removed += self.orphans.expire(now);
        removed
    }

    // ─── Block Assembly ──────────────────────────────────────────────

    /// Entries in the order a block should include them: best ancestor fee
    /// rate first, with every entry's ancestors placed ahead of it.
    pub fn block_candidates(&self) -> Vec<&MempoolEntry> {
        let mut by_score: Vec<&MempoolEntry> = self.entries.values().collect();
        by_score.sort_by(|a, b| {
            b.ancestor_fee_rate()
                .cmp(&a.ancestor_fee_rate())
                .then(a.ancestor_count.cmp(&b.ancestor_count))
                .then(a.txid.cmp(&b.txid))
        });

        let mut placed = HashSet::new();
        let mut out = Vec::with_capacity(by_score.len());
        for entry in by_score {
            if placed.contains(&entry.txid) {
                continue;
            }
            let mut package: Vec<&MempoolEntry> = self
                .ancestors_of(&entry.txid)
                .iter()
                .filter(|t| !placed.contains(*t))
                .filter_map(|t| self.entries.get(t))
                .collect();
            package.sort_by(|a, b| a.ancestor_count.cmp(&b.ancestor_count).then(a.txid.cmp(&b.txid)));
            package.push(entry);
            for e in package {
                if placed.insert(e.txid) {
                    out.push(e);
                }
            }
        }
        out
    }

    // ─── Persistence ─────────────────────────────────────────────────

    /// Write the pool to `path` (through a temporary file).
    pub fn save(&self, path: &Path) -> Result<usize, StorageError> {
        let mut txs: Vec<(Transaction, u64)> = self
            .block_candidates()
            .into_iter()
            .map(|e| (e.tx.clone(), e.time))
            .collect();
        txs.sort_by_key(|(_, time)| *time);
        let count = txs.len();
        let bytes = crate::storage::encode(&MempoolDump { version: MEMPOOL_DUMP_VERSION, txs })?;
        let tmp = path.with_extension("dat.new");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        tracing::info!("💾 Saved {} mempool transaction(s)", count);
        Ok(count)
    }

    /// Re-admit transactions saved by `save`. Returns how many were accepted.
    pub fn load(&mut self, path: &Path, chain: &ChainState, now: u64) -> Result<usize, ChainStateError> {
        if !path.exists() {
            return Ok(0);
        }
        let bytes = fs::read(path).map_err(StorageError::from)?;
        let dump: MempoolDump = crate::storage::decode(&bytes)?;
        if dump.version != MEMPOOL_DUMP_VERSION {
            tracing::warn!("Ignoring mempool file with version {}", dump.version);
            return Ok(0);
        }

        let mut accepted = 0;
        let mut expired = 0;
        for (tx, time) in dump.txs {
            if time + self.opts.expiry_secs < now {
                expired += 1;
                continue;
            }
            match self.accept_transaction(tx, chain, time) {
                Ok(_) => accepted += 1,
                Err(ChainStateError::Validation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!("Loaded {} mempool transaction(s), {} expired", accepted, expired);
        Ok(accepted)
    }
}
