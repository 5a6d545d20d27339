//! Block index: every header ever accepted, in an arena addressed by `BlockId`.
//!
//! Entries point at their parent and at a skip ancestor chosen so that
//! `get_ancestor` runs in O(log n). Entries are never removed; invalid ones are
//! flagged and their descendants inherit `failed_parent`.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::core::params::ChainParams;
use crate::core::types::{BlockHeader, Hash256, NULL_HASH};
use crate::pow;
use crate::storage::FilePos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Validation level reached by a block. Only ever raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Header is well formed, connects to a known parent and passed the
    /// contextual header checks
    TreeValid,
    /// Body stored and passed the context-free and contextual block checks,
    /// and every ancestor has reached this level too
    TransactionsValid,
    /// Connected to the UTXO set at least once
    ChainValid,
}

#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u64,
    /// Cumulative work of the chain ending here
    pub chain_work: BigUint,
    pub status: BlockStatus,
    pub failed: bool,
    pub failed_parent: bool,
    pub data_pos: Option<FilePos>,
    pub undo_pos: Option<FilePos>,
    pub tx_count: u32,
    /// This block and all its ancestors have bodies on disk
    pub chain_linked: bool,
    pub parent: Option<BlockId>,
    pub skip: Option<BlockId>,
    /// Arrival order, breaks ties between equal-work candidates
    pub sequence: u64,
    /// Median of this block's timestamp and its ten predecessors'
    pub median_time_past: u64,
    /// Fractional difficulty the child of this block is held to
    pub next_difficulty_milli: u32,
}

impl BlockIndexEntry {
    pub fn have_data(&self) -> bool {
        self.data_pos.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed || self.failed_parent
    }

    pub fn is_valid(&self, level: BlockStatus) -> bool {
        !self.is_failed() && self.status >= level
    }

    fn to_record(&self) -> BlockIndexRecord {
        BlockIndexRecord {
            header: self.header.clone(),
            status: self.status,
            failed: self.failed,
            failed_parent: self.failed_parent,
            data_pos: self.data_pos,
            undo_pos: self.undo_pos,
            tx_count: self.tx_count,
            sequence: self.sequence,
        }
    }
}

/// On-disk form of an entry. Derived fields are rebuilt at load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexRecord {
    pub header: BlockHeader,
    pub status: BlockStatus,
    pub failed: bool,
    pub failed_parent: bool,
    pub data_pos: Option<FilePos>,
    pub undo_pos: Option<FilePos>,
    pub tx_count: u32,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("proof of work below the header's difficulty")]
    HighHash,
    #[error("genesis header does not match chain parameters")]
    BadGenesis,
    #[error("unknown parent {}", hex::encode(.0))]
    UnknownParent(Hash256),
    #[error("parent block is invalid")]
    InvalidParent,
    #[error("header is already known to be invalid")]
    KnownInvalid,
    #[error("difficulty {got} does not match required {required}")]
    BadDifficulty { got: u32, required: u32 },
}

#[derive(Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, BlockId>,
    children: HashMap<BlockId, Vec<BlockId>>,
    /// Bodies whose parent has no body yet, keyed by that parent
    unlinked: HashMap<BlockId, Vec<BlockId>>,
    dirty: HashSet<BlockId>,
    next_sequence: u64,
    best_header: Option<BlockId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn entry(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.lookup(hash).map(|id| self.entry(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BlockIndexEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (BlockId(i as u32), e))
    }

    pub fn children(&self, id: BlockId) -> &[BlockId] {
        self.children.get(&id).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Most-work header known, failed branches excluded.
    pub fn best_header(&self) -> Option<BlockId> {
        self.best_header
    }

    // ─── Insertion ───────────────────────────────────────────────────

    /// Insert a header, or return the existing id if it is already known.
    ///
    /// Checks proof-of-work, that the parent is known and not invalid, and
    /// that the difficulty is what the parent requires.
    pub fn insert_header(&mut self, header: &BlockHeader, params: &ChainParams) -> Result<BlockId, HeaderError> {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return if self.entry(id).is_failed() { Err(HeaderError::KnownInvalid) } else { Ok(id) };
        }

        let parent = if header.prev_hash == NULL_HASH {
            if hash != params.genesis_hash() {
                return Err(HeaderError::BadGenesis);
            }
            None
        } else {
            if !pow::check_proof_of_work(&hash, header.difficulty_target) {
                return Err(HeaderError::HighHash);
            }
            let parent = self.lookup(&header.prev_hash).ok_or(HeaderError::UnknownParent(header.prev_hash))?;
            let pe = self.entry(parent);
            if pe.is_failed() {
                return Err(HeaderError::InvalidParent);
            }
            let required = pow::milli_to_bits(pe.next_difficulty_milli, params);
            if !pow::difficulty_acceptable(header.difficulty_target, required, params) {
                return Err(HeaderError::BadDifficulty { got: header.difficulty_target, required });
            }
            Some(parent)
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = self.push_entry(header.clone(), hash, parent, sequence, params);

        let entry = self.entry(id);
        let better = match self.best_header {
            None => true,
            Some(best) => entry.chain_work > self.entry(best).chain_work,
        };
        if better {
            self.best_header = Some(id);
        }
        Ok(id)
    }

    fn push_entry(
        &mut self,
        header: BlockHeader,
        hash: Hash256,
        parent: Option<BlockId>,
        sequence: u64,
        params: &ChainParams,
    ) -> BlockId {
        let id = BlockId(self.entries.len() as u32);
        let work = pow::block_work(header.difficulty_target);

        let (height, chain_work, median_time_past, next_difficulty_milli, skip) = match parent {
            None => (0, work, header.timestamp, params.initial_difficulty * 1000, None),
            Some(p) => {
                let pe = self.entry(p);
                let height = pe.height + 1;
                let mut timestamps = self.recent_timestamps(p, pow::DIFFICULTY_WINDOW - 1);
                timestamps.push(header.timestamp);
                (
                    height,
                    &pe.chain_work + work,
                    pow::median_time(&timestamps),
                    pow::next_difficulty_milli(pe.next_difficulty_milli, &timestamps, params),
                    self.get_ancestor(p, skip_height(height)),
                )
            }
        };

        self.entries.push(BlockIndexEntry {
            hash,
            header,
            height,
            chain_work,
            status: BlockStatus::TreeValid,
            failed: false,
            failed_parent: false,
            data_pos: None,
            undo_pos: None,
            tx_count: 0,
            chain_linked: false,
            parent,
            skip,
            sequence,
            median_time_past,
            next_difficulty_milli,
        });
        self.by_hash.insert(hash, id);
        if let Some(p) = parent {
            self.children.entry(p).or_default().push(id);
        }
        self.dirty.insert(id);
        id
    }

    /// Timestamps of `id` and up to `count - 1` ancestors, oldest first.
    fn recent_timestamps(&self, id: BlockId, count: usize) -> Vec<u64> {
        let mut out = Vec::with_capacity(count + 1);
        let mut cur = Some(id);
        while let Some(c) = cur {
            if out.len() == count {
                break;
            }
            let e = self.entry(c);
            out.push(e.header.timestamp);
            cur = e.parent;
        }
        out.reverse();
        out
    }

    // ─── Status Updates ──────────────────────────────────────────────

    /// Record that the body is stored. Returns every block that became
    /// connectable (itself and waiting descendants), parents first. A body
    /// only reaches `TransactionsValid` once every ancestor has one too.
    pub fn set_have_data(&mut self, id: BlockId, pos: FilePos, tx_count: u32) -> Vec<BlockId> {
        let parent = {
            let e = &mut self.entries[id.index()];
            e.data_pos = Some(pos);
            e.tx_count = tx_count;
            e.parent
        };
        self.dirty.insert(id);

        if let Some(p) = parent {
            if !self.entry(p).chain_linked {
                self.unlinked.entry(p).or_default().push(id);
                return Vec::new();
            }
        }

        let mut linked = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(cur) = queue.pop_front() {
            let parent_valid = self.entries[cur.index()]
                .parent
                .map_or(true, |p| self.entries[p.index()].status >= BlockStatus::TransactionsValid);
            let e = &mut self.entries[cur.index()];
            e.chain_linked = true;
            if parent_valid && e.status < BlockStatus::TransactionsValid {
                e.status = BlockStatus::TransactionsValid;
            }
            self.dirty.insert(cur);
            linked.push(cur);
            if let Some(waiting) = self.unlinked.remove(&cur) {
                queue.extend(waiting);
            }
        }
        linked
    }

    pub fn set_undo_pos(&mut self, id: BlockId, pos: FilePos) {
        self.entries[id.index()].undo_pos = Some(pos);
        self.dirty.insert(id);
    }

    pub fn raise_status(&mut self, id: BlockId, status: BlockStatus) {
        let e = &mut self.entries[id.index()];
        if e.status < status {
            e.status = status;
            self.dirty.insert(id);
        }
    }

    /// Drop `ChainValid` back to `TransactionsValid` on every entry, used
    /// when the coin set is rebuilt from scratch.
    pub fn reset_chain_valid(&mut self) {
        for (i, e) in self.entries.iter_mut().enumerate() {
            if e.status == BlockStatus::ChainValid {
                e.status = BlockStatus::TransactionsValid;
                self.dirty.insert(BlockId(i as u32));
            }
        }
    }

    /// Flag `id` invalid and every descendant as having an invalid parent.
    /// Returns the descendants touched.
    pub fn mark_failed(&mut self, id: BlockId) -> Vec<BlockId> {
        self.entries[id.index()].failed = true;
        self.dirty.insert(id);

        let descendants = self.descendants(id);
        for &d in &descendants {
            self.entries[d.index()].failed_parent = true;
            self.dirty.insert(d);
        }
        self.recompute_best_header();
        descendants
    }

    /// Clear failure flags on `id`, its descendants and its ancestors.
    pub fn clear_failure(&mut self, id: BlockId) {
        let mut touched = self.descendants(id);
        touched.push(id);
        let mut cur = self.entry(id).parent;
        while let Some(c) = cur {
            touched.push(c);
            cur = self.entry(c).parent;
        }
        for t in touched {
            let e = &mut self.entries[t.index()];
            if e.failed || e.failed_parent {
                e.failed = false;
                e.failed_parent = false;
                self.dirty.insert(t);
            }
        }
        self.recompute_best_header();
    }

    fn descendants(&self, id: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut queue: VecDeque<BlockId> = self.children(id).iter().copied().collect();
        while let Some(cur) = queue.pop_front() {
            out.push(cur);
            queue.extend(self.children(cur).iter().copied());
        }
        out
    }

    fn recompute_best_header(&mut self) {
        let mut best: Option<BlockId> = None;
        for (id, e) in self.iter() {
            if e.is_failed() {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let be = self.entry(b);
                    e.chain_work > be.chain_work || (e.chain_work == be.chain_work && e.sequence < be.sequence)
                }
            };
            if better {
                best = Some(id);
            }
        }
        self.best_header = best;
    }

    // ─── Traversal ───────────────────────────────────────────────────

    /// Ancestor of `id` at `height`, `None` if `height` is above it.
    pub fn get_ancestor(&self, id: BlockId, height: u64) -> Option<BlockId> {
        let mut walk = id;
        let mut walk_height = self.entry(walk).height;
        if height > walk_height {
            return None;
        }

        while walk_height > height {
            let h_skip = skip_height(walk_height);
            let h_skip_prev = skip_height(walk_height - 1);
            let e = self.entry(walk);
            match e.skip {
                Some(skip)
                    if h_skip == height
                        || (h_skip > height && !(h_skip_prev + 2 < h_skip && h_skip_prev >= height)) =>
                {
                    walk = skip;
                    walk_height = h_skip;
                }
                _ => {
                    walk = e.parent?;
                    walk_height -= 1;
                }
            }
        }
        Some(walk)
    }

    /// Last block both `a` and `b` descend from (or are).
    pub fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let ha = self.entry(a).height;
        let hb = self.entry(b).height;
        let mut a = if ha > hb { self.get_ancestor(a, hb)? } else { a };
        let mut b = if hb > ha { self.get_ancestor(b, ha)? } else { b };
        while a != b {
            a = self.entry(a).parent?;
            b = self.entry(b).parent?;
        }
        Some(a)
    }

    /// Whether `ancestor` is on the path from genesis to `id`.
    pub fn is_ancestor(&self, ancestor: BlockId, id: BlockId) -> bool {
        self.get_ancestor(id, self.entry(ancestor).height) == Some(ancestor)
    }

    // ─── Persistence ─────────────────────────────────────────────────

    /// Entries changed since the last call, ready to be written.
    pub fn take_dirty(&mut self) -> Vec<(Hash256, BlockIndexRecord)> {
        let mut ids: Vec<BlockId> = self.dirty.drain().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let e = self.entry(id);
                (e.hash, e.to_record())
            })
            .collect()
    }

    /// Rebuild the index from stored records.
    pub fn load(mut records: Vec<BlockIndexRecord>, params: &ChainParams) -> Result<Self, String> {
        records.sort_by_key(|r| r.sequence);
        let mut index = BlockIndex::new();

        for record in records {
            let hash = record.header.hash();
            if index.by_hash.contains_key(&hash) {
                continue;
            }
            let parent = if record.header.prev_hash == NULL_HASH {
                None
            } else {
                Some(index.lookup(&record.header.prev_hash).ok_or_else(|| {
                    format!("block {} stored before its parent", hex::encode(hash))
                })?)
            };

            let id = index.push_entry(record.header, hash, parent, record.sequence, params);
            let linked = record.data_pos.is_some()
                && parent.map_or(true, |p| index.entry(p).chain_linked);
            if record.data_pos.is_some() && !linked {
                if let Some(p) = parent {
                    index.unlinked.entry(p).or_default().push(id);
                }
            }

            let e = &mut index.entries[id.index()];
            e.status = record.status;
            e.failed = record.failed;
            e.failed_parent = record.failed_parent;
            e.data_pos = record.data_pos;
            e.undo_pos = record.undo_pos;
            e.tx_count = record.tx_count;
            e.chain_linked = linked;
            index.next_sequence = index.next_sequence.max(record.sequence + 1);
        }

        index.dirty.clear();
        index.recompute_best_header();
        Ok(index)
    }
}

/// Height the skip pointer of a block at `height` targets.
fn skip_height(height: u64) -> u64 {
    fn invert_lowest_one(n: u64) -> u64 {
        n & n.wrapping_sub(1)
    }
    if height < 2 {
        return 0;
    }
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}
