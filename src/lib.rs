//! chaind: chain-state validation and reorganization engine for a UTXO full node.
//!
//! The crate is organised bottom-up:
//!   - `core`     consensus types, chain parameters and the script interpreter
//!   - `crypto`   hashing, signatures and transaction identifiers
//!   - `pow`      proof-of-work checks, chain work and difficulty retargeting
//!   - `storage`  key/value store abstraction and append-only block files
//!   - `chain`    block index, coins cache, validation, check queue and the
//!                `ChainState` that selects and activates the best chain
//!   - `index`    optional transaction / address / spent / timestamp indexes
//!   - `mempool`  unconfirmed transaction pool and its reorg reconciliation
//!   - `miner`    block templates and a regtest miner
//!   - `node`     the public node surface and its work queue
//!   - `config`   node configuration

pub mod chain;
pub mod config;
pub mod core;
pub mod crypto;
pub mod index;
pub mod mempool;
pub mod miner;
pub mod node;
pub mod pow;
pub mod storage;

/// Seconds since the unix epoch.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
