//! Cache of signatures already verified, shared by mempool admission and
//! block connection so a transaction's signatures are checked once.

use rand::RngCore;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::core::script::SignatureChecker;
use crate::core::types::Hash256;
use crate::crypto;

const ENTRY_SIZE: usize = 32;

pub struct SignatureCache {
    /// Per-process salt so cache keys cannot be precomputed
    salt: [u8; 32],
    entries: Mutex<HashSet<[u8; 32]>>,
    max_entries: usize,
}

impl SignatureCache {
    /// Cache bounded to roughly `max_bytes` of keys.
    pub fn new(max_bytes: usize) -> Self {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        SignatureCache {
            salt,
            entries: Mutex::new(HashSet::new()),
            max_entries: max_bytes / ENTRY_SIZE,
        }
    }

    fn key(&self, pubkey: &[u8; 32], sighash: &Hash256, sig: &[u8; 64]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.salt);
        hasher.update(sighash);
        hasher.update(pubkey);
        hasher.update(sig);
        *hasher.finalize().as_bytes()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<[u8; 32]>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the triple is cached. With `erase`, a hit is also removed:
    /// block validation sees each signature once, so the slot is freed.
    pub fn contains(&self, pubkey: &[u8; 32], sighash: &Hash256, sig: &[u8; 64], erase: bool) -> bool {
        let key = self.key(pubkey, sighash, sig);
        let mut entries = self.lock();
        if erase {
            entries.remove(&key)
        } else {
            entries.contains(&key)
        }
    }

    pub fn insert(&self, pubkey: &[u8; 32], sighash: &Hash256, sig: &[u8; 64]) {
        if self.max_entries == 0 {
            return;
        }
        let key = self.key(pubkey, sighash, sig);
        let mut entries = self.lock();
        while entries.len() >= self.max_entries {
            // Keys are salted hashes, so the first one is effectively random.
            let Some(victim) = entries.iter().next().copied() else { break };
            entries.remove(&victim);
        }
        entries.insert(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `SignatureChecker` that consults the cache before verifying.
///
/// `store` is set for mempool admission (remember good signatures) and
/// cleared for block connection (consume cached entries).
pub struct CachingChecker<'a> {
    pub cache: &'a SignatureCache,
    pub store: bool,
}

impl SignatureChecker for CachingChecker<'_> {
    fn check(&self, pubkey: &[u8; 32], sighash: &Hash256, sig: &[u8; 64]) -> bool {
        if self.cache.contains(pubkey, sighash, sig, !self.store) {
            return true;
        }
        if !crypto::verify_signature(pubkey, sighash, sig) {
            return false;
        }
        if self.store {
            self.cache.insert(pubkey, sighash, sig);
        }
        true
    }
}
