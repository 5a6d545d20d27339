//! Node configuration: `chaind.json` in the data directory, with command
//! line flags layered on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chain::checkqueue;
use crate::chain::{ChainStateError, ChainStateOptions};
use crate::core::params::{ChainParams, Network};
use crate::index::IndexFlags;
use crate::mempool::MempoolOptions;

pub const CONFIG_FILE: &str = "chaind.json";
pub const DEFAULT_DATA_DIR: &str = "chaind_data";

const MIB: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    /// Script verification threads: 0 = one per core, negative = leave
    /// that many cores free
    pub par: i32,
    /// Coins cache budget in MiB
    pub dbcache: usize,
    pub db_batch_size: usize,
    /// Mempool budget in MiB
    pub max_mempool: usize,
    /// Hours before an unconfirmed transaction is dropped
    pub mempool_expiry: u64,
    pub max_orphan_tx: usize,
    pub max_orphan_blocks: usize,
    pub txindex: bool,
    pub addressindex: bool,
    pub spentindex: bool,
    pub timestampindex: bool,
    /// Blocks checked by `verify_db` at startup
    pub checkblocks: u64,
    pub checklevel: u32,
    pub reindex_chainstate: bool,
    pub persist_mempool: bool,
    pub stop_at_height: Option<u64>,
    /// Signature cache budget in MiB
    pub max_sig_cache_size: usize,
    /// Minimum relay fee per 1000 bytes
    pub min_relay_fee: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: Network::Main,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            par: 0,
            dbcache: 450,
            db_batch_size: 16 << 10,
            max_mempool: 300,
            mempool_expiry: 336,
            max_orphan_tx: 100,
            max_orphan_blocks: 750,
            txindex: false,
            addressindex: false,
            spentindex: false,
            timestampindex: false,
            checkblocks: 6,
            checklevel: 3,
            reindex_chainstate: false,
            persist_mempool: true,
            stop_at_height: None,
            max_sig_cache_size: 32,
            min_relay_fee: 1000,
        }
    }
}

impl NodeConfig {
    /// Read `chaind.json` from `data_dir`, falling back to defaults when it
    /// does not exist. `data_dir` always wins over the value in the file.
    pub fn load(data_dir: &Path) -> Result<Self, ChainStateError> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| ChainStateError::Config(format!("reading {}: {}", path.display(), e)))?;
            serde_json::from_str::<NodeConfig>(&json)
                .map_err(|e| ChainStateError::Config(format!("parsing {}: {}", path.display(), e)))?
        } else {
            NodeConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ChainStateError> {
        let io_err = |e: std::io::Error| ChainStateError::Config(e.to_string());
        std::fs::create_dir_all(&self.data_dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(self).map_err(|e| ChainStateError::Config(e.to_string()))?;
        std::fs::write(self.data_dir.join(CONFIG_FILE), json).map_err(io_err)
    }

    pub fn validate(&self) -> Result<(), ChainStateError> {
        if self.dbcache == 0 {
            return Err(ChainStateError::Config("dbcache must be at least 1 MiB".into()));
        }
        if self.db_batch_size == 0 {
            return Err(ChainStateError::Config("db_batch_size must be positive".into()));
        }
        if self.checklevel > 4 {
            return Err(ChainStateError::Config(format!("checklevel {} out of range 0-4", self.checklevel)));
        }
        Ok(())
    }

    pub fn params(&self) -> ChainParams {
        ChainParams::for_network(self.network)
    }

    pub fn indexes(&self) -> IndexFlags {
        IndexFlags {
            txindex: self.txindex,
            addressindex: self.addressindex,
            spentindex: self.spentindex,
            timestampindex: self.timestampindex,
        }
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn chainstate_dir(&self) -> PathBuf {
        self.data_dir.join("chainstate")
    }

    pub fn mempool_path(&self) -> PathBuf {
        self.data_dir.join("mempool.dat")
    }

    pub fn chain_state_options(&self) -> ChainStateOptions {
        ChainStateOptions {
            script_threads: checkqueue::script_threads(self.par),
            coins_cache_bytes: self.dbcache * MIB,
            db_batch_size: self.db_batch_size,
            max_orphan_blocks: self.max_orphan_blocks,
            sig_cache_bytes: self.max_sig_cache_size * MIB,
            indexes: self.indexes(),
            reindex_chainstate: self.reindex_chainstate,
            stop_at_height: self.stop_at_height,
            ..ChainStateOptions::default()
        }
    }

    pub fn mempool_options(&self) -> MempoolOptions {
        MempoolOptions {
            max_bytes: self.max_mempool * MIB,
            expiry_secs: self.mempool_expiry * 60 * 60,
            min_relay_fee: self.min_relay_fee,
            max_orphan_txs: self.max_orphan_tx,
            ..MempoolOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{ "network": "regtest", "dbcache": 16, "txindex": true }"#)
            .unwrap();

        let config = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.data_dir, dir.path());
        assert!(config.indexes().txindex);
        assert_eq!(config.chain_state_options().coins_cache_bytes, 16 * MIB);
        assert_eq!(config.max_orphan_blocks, 750);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            stop_at_height: Some(10),
            ..NodeConfig::default()
        };
        config.save().unwrap();
        assert_eq!(NodeConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_validate() {
        let config = NodeConfig { checklevel: 5, ..NodeConfig::default() };
        assert!(matches!(config.validate(), Err(ChainStateError::Config(_))));
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(NodeConfig::load(dir.path()), Err(ChainStateError::Config(_))));
    }
}
