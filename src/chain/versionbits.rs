//! Version-bits deployment state.
//!
//! A deployment becomes active for every block after a window in which at
//! least `threshold` of `window` blocks set its bit, and stays active. The
//! verdict for each window is cached by the id of the window's last block, so
//! forks that share history share cached windows.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::params::{Activation, ChainParams, Deployment, Rule, RuleSet, VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK};

use super::index::{BlockId, BlockIndex};

#[derive(Default)]
pub struct VersionBitsCache {
    /// (rule, last block of a window) -> active for the blocks after it
    windows: Mutex<HashMap<(Rule, BlockId), bool>>,
}

pub fn signals(version: u32, bit: u8) -> bool {
    version & VERSIONBITS_TOP_MASK == VERSIONBITS_TOP_BITS && version & (1u32 << bit) != 0
}

impl VersionBitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules in force for a block whose parent is `parent` (`None` for genesis).
    pub fn ruleset_for_child(&self, index: &BlockIndex, parent: Option<BlockId>, params: &ChainParams) -> RuleSet {
        let height = parent.map_or(0, |p| index.entry(p).height + 1);
        params.ruleset_for_height(height, |deployment| match parent {
            Some(p) => self.is_active(index, p, deployment),
            None => false,
        })
    }

    pub fn clear(&self) {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn is_active(&self, index: &BlockIndex, parent: BlockId, deployment: &Deployment) -> bool {
        let Activation::VersionBits { bit, start_height, window, threshold } = deployment.activation else {
            return false;
        };
        if window == 0 {
            return false;
        }
        let height = index.entry(parent).height + 1;
        let window_start = height - height % window;
        if window_start < window {
            return false;
        }
        let Some(mut end) = index.get_ancestor(parent, window_start - 1) else {
            return false;
        };

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        // Walk back to the newest window with a known verdict.
        let mut uncached = Vec::new();
        let mut state = false;
        loop {
            if let Some(&known) = windows.get(&(deployment.rule, end)) {
                state = known;
                break;
            }
            let first = index.entry(end).height + 1 - window;
            if first < start_height {
                windows.insert((deployment.rule, end), false);
                break;
            }
            uncached.push(end);
            if first == 0 {
                break;
            }
            match index.get_ancestor(end, first - 1) {
                Some(prev) => end = prev,
                None => break,
            }
        }

        for end in uncached.into_iter().rev() {
            state = state || count_signals(index, end, bit, window) >= threshold;
            windows.insert((deployment.rule, end), state);
        }
        state
    }
}

fn count_signals(index: &BlockIndex, end: BlockId, bit: u8, window: u64) -> u64 {
    let mut count = 0;
    let mut cur = Some(end);
    for _ in 0..window {
        let Some(id) = cur else { break };
        let entry = index.entry(id);
        if signals(entry.header.version, bit) {
            count += 1;
        }
        cur = entry.parent;
    }
    count
}
