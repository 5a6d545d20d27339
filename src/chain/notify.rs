//! Chain event subscribers.
//!
//! Callbacks run synchronously on the thread that changed the chain, in
//! registration order, before the next block is connected or disconnected.

use crate::core::types::Block;

use super::index::BlockIndexEntry;
use super::undo::BlockUndo;

type ConnectedFn = Box<dyn Fn(&Block, &BlockIndexEntry, &BlockUndo) + Send + Sync>;
type DisconnectedFn = Box<dyn Fn(&Block, &BlockIndexEntry) + Send + Sync>;
type TipFn = Box<dyn Fn(&BlockIndexEntry) + Send + Sync>;

#[derive(Default)]
pub struct ValidationSignals {
    connected: Vec<ConnectedFn>,
    disconnected: Vec<DisconnectedFn>,
    tip_updated: Vec<TipFn>,
}

impl ValidationSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_block_connected(&mut self, f: impl Fn(&Block, &BlockIndexEntry, &BlockUndo) + Send + Sync + 'static) {
        self.connected.push(Box::new(f));
    }

    pub fn subscribe_block_disconnected(&mut self, f: impl Fn(&Block, &BlockIndexEntry) + Send + Sync + 'static) {
        self.disconnected.push(Box::new(f));
    }

    /// Called once per activation step, after the tip settles.
    pub fn subscribe_tip_updated(&mut self, f: impl Fn(&BlockIndexEntry) + Send + Sync + 'static) {
        self.tip_updated.push(Box::new(f));
    }

    pub(crate) fn block_connected(&self, block: &Block, entry: &BlockIndexEntry, undo: &BlockUndo) {
        for f in &self.connected {
            f(block, entry, undo);
        }
    }

    pub(crate) fn block_disconnected(&self, block: &Block, entry: &BlockIndexEntry) {
        for f in &self.disconnected {
            f(block, entry);
        }
    }

    pub(crate) fn tip_updated(&self, entry: &BlockIndexEntry) {
        for f in &self.tip_updated {
            f(entry);
        }
    }
}
