//! Blocks that arrived before their parent.

use std::collections::HashMap;

use crate::core::types::{Block, Hash256};

struct OrphanBlock {
    block: Block,
    added: u64,
}

pub struct OrphanBlocks {
    blocks: HashMap<Hash256, OrphanBlock>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
    max_blocks: usize,
    expiry_secs: u64,
}

impl OrphanBlocks {
    pub fn new(max_blocks: usize, expiry_secs: u64) -> Self {
        OrphanBlocks { blocks: HashMap::new(), by_parent: HashMap::new(), max_blocks, expiry_secs }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Buffer `block`. Returns false if it was already buffered or the pool
    /// holds no blocks at all.
    pub fn add(&mut self, block: Block, now: u64) -> bool {
        if self.max_blocks == 0 {
            return false;
        }
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return false;
        }

        self.expire(now);
        while self.blocks.len() >= self.max_blocks {
            let Some(oldest) = self.blocks.iter().min_by_key(|(_, o)| o.added).map(|(h, _)| *h) else {
                break;
            };
            self.remove(&oldest);
        }

        self.by_parent.entry(block.header.prev_hash).or_default().push(hash);
        self.blocks.insert(hash, OrphanBlock { block, added: now });
        true
    }

    /// Drop orphans older than the expiry. Returns how many were dropped.
    pub fn expire(&mut self, now: u64) -> usize {
        let stale: Vec<Hash256> = self
            .blocks
            .iter()
            .filter(|(_, o)| o.added + self.expiry_secs < now)
            .map(|(h, _)| *h)
            .collect();
        for hash in &stale {
            self.remove(hash);
        }
        stale.len()
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let orphan = self.blocks.remove(hash)?;
        let parent = orphan.block.header.prev_hash;
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(orphan.block)
    }

    /// Remove and return every buffered child of `parent`.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Block> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        children
            .into_iter()
            .filter_map(|h| self.blocks.remove(&h).map(|o| o.block))
            .collect()
    }
}
