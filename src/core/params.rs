//! Chain parameters.
//! All consensus-critical constants are defined here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::script;
use super::types::{Block, BlockHeader, Hash256, Transaction, NULL_HASH};

/// Base unit denomination (like satoshis for Bitcoin)
pub const COIN: u64 = 100_000_000;

/// Maximum total supply; no single amount or sum of amounts may exceed it
pub const MAX_MONEY: u64 = 42_000_000 * COIN;

/// Initial block reward: 50 coins
pub const INITIAL_BLOCK_REWARD: u64 = 50 * COIN;

/// Maximum serialized block size in bytes (4 MB)
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Maximum serialized transaction size in bytes
pub const MAX_TX_SIZE: usize = 1024 * 1024;

/// Maximum transactions per block
pub const MAX_TXS_PER_BLOCK: usize = 10_000;

/// Maximum length of a single locking or unlocking script
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Coinbase unlocking script length bounds
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 8;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Headers may run at most this far (seconds) ahead of local time
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Number of ancestors in the median-time-past window
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Genesis block timestamp (2025-01-01 00:00:00 UTC)
pub const GENESIS_TIMESTAMP: u64 = 1735689600;

/// Version-bits signalling: top three bits must read 001
pub const VERSIONBITS_TOP_BITS: u32 = 0x2000_0000;
pub const VERSIONBITS_TOP_MASK: u32 = 0xE000_0000;

// ─── Networks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        };
        f.write_str(s)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

// ─── Rule Activation ─────────────────────────────────────────────────

/// Consensus rules that switch on during the life of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    /// Coinbase unlocking script must start with the block height,
    /// and block version must be at least 2.
    HeightInCoinbase,
    /// Time-based lock times are compared against the parent's median time
    /// past instead of the block timestamp.
    MedianTimeLocktime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Always,
    Never,
    AtHeight(u64),
    /// Active for every retarget window after one in which at least
    /// `threshold` of `window` blocks signalled `bit`.
    VersionBits { bit: u8, start_height: u64, window: u64, threshold: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment {
    pub rule: Rule,
    pub activation: Activation,
}

/// The set of rules in force for a particular block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub height_in_coinbase: bool,
    pub median_time_locktime: bool,
}

impl RuleSet {
    pub fn enable(&mut self, rule: Rule) {
        match rule {
            Rule::HeightInCoinbase => self.height_in_coinbase = true,
            Rule::MedianTimeLocktime => self.median_time_locktime = true,
        }
    }

    pub fn min_block_version(&self) -> u32 {
        if self.height_in_coinbase {
            2
        } else {
            1
        }
    }
}

// ─── Chain Parameters ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    /// Magic prefix of every record in the block and undo files
    pub magic: [u8; 4],
    pub genesis_timestamp: u64,
    /// Difficulty (leading zero bits) of the genesis block
    pub initial_difficulty: u32,
    pub min_difficulty: u32,
    pub max_difficulty: u32,
    /// When set, any difficulty at or above `min_difficulty` is accepted
    pub pow_no_retargeting: bool,
    /// Target block time in seconds
    pub target_block_time: u64,
    pub halving_interval: u64,
    /// Blocks before a coinbase output may be spent
    pub coinbase_maturity: u64,
    /// Deepest reorganization undo data is kept for
    pub max_reorg_depth: u64,
    pub deployments: Vec<Deployment>,
}

impl ChainParams {
    pub fn main() -> Self {
        ChainParams {
            network: Network::Main,
            magic: [0xC4, 0xA1, 0xD0, 0x01],
            genesis_timestamp: GENESIS_TIMESTAMP,
            initial_difficulty: 16,
            min_difficulty: 8,
            max_difficulty: 200,
            pow_no_retargeting: false,
            target_block_time: 90,
            // ~6 years at 90 second blocks
            halving_interval: 2_103_840,
            coinbase_maturity: 100,
            max_reorg_depth: 288,
            deployments: vec![
                Deployment { rule: Rule::HeightInCoinbase, activation: Activation::AtHeight(1) },
                Deployment {
                    rule: Rule::MedianTimeLocktime,
                    activation: Activation::VersionBits { bit: 0, start_height: 0, window: 2016, threshold: 1916 },
                },
            ],
        }
    }

    pub fn testnet() -> Self {
        ChainParams {
            network: Network::Test,
            magic: [0xEF, 0x01, 0xF0, 0x42],
            initial_difficulty: 12,
            min_difficulty: 4,
            deployments: vec![
                Deployment { rule: Rule::HeightInCoinbase, activation: Activation::AtHeight(1) },
                Deployment {
                    rule: Rule::MedianTimeLocktime,
                    activation: Activation::VersionBits { bit: 0, start_height: 0, window: 2016, threshold: 1512 },
                },
            ],
            ..Self::main()
        }
    }

    /// Local testing network: trivial proof-of-work, no retargeting.
    pub fn regtest() -> Self {
        ChainParams {
            network: Network::Regtest,
            magic: [0xFA, 0xBF, 0xB5, 0xDA],
            initial_difficulty: 0,
            min_difficulty: 0,
            pow_no_retargeting: true,
            halving_interval: 150,
            deployments: vec![
                Deployment { rule: Rule::HeightInCoinbase, activation: Activation::AtHeight(1) },
                Deployment {
                    rule: Rule::MedianTimeLocktime,
                    activation: Activation::VersionBits { bit: 0, start_height: 0, window: 144, threshold: 108 },
                },
            ],
            ..Self::main()
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self::main(),
            Network::Test => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// Rules in force for a block at `height`. `voted` answers for
    /// version-bits deployments, whose state depends on the chain.
    pub fn ruleset_for_height(&self, height: u64, mut voted: impl FnMut(&Deployment) -> bool) -> RuleSet {
        let mut rules = RuleSet::default();
        for deployment in &self.deployments {
            let active = match deployment.activation {
                Activation::Always => true,
                Activation::Never => false,
                Activation::AtHeight(h) => height >= h,
                Activation::VersionBits { .. } => voted(deployment),
            };
            if active {
                rules.enable(deployment.rule);
            }
        }
        rules
    }

    /// Block subsidy at a given height
    pub fn block_reward(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval;
        if halvings >= 64 {
            return 0;
        }
        INITIAL_BLOCK_REWARD >> halvings
    }

    /// Version a miner should put in a new block: every version-bits
    /// deployment is signalled.
    pub fn signalling_version(&self) -> u32 {
        self.deployments
            .iter()
            .fold(VERSIONBITS_TOP_BITS, |v, d| match d.activation {
                Activation::VersionBits { bit, .. } => v | (1u32 << bit),
                _ => v,
            })
    }

    pub fn genesis_block(&self) -> Block {
        // Regtest genesis pays anyone-can-spend so tests can use it.
        let script_pubkey = match self.network {
            Network::Regtest => script::script_op_true(),
            _ => script::script_p2pkh(&[0xCF; 32]),
        };
        let coinbase = Transaction::new_coinbase(0, self.block_reward(0), script_pubkey, b"genesis");
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: NULL_HASH,
                merkle_root: NULL_HASH,
                timestamp: self.genesis_timestamp,
                difficulty_target: self.initial_difficulty,
                nonce: 0,
            },
            transactions: vec![coinbase],
        };
        block.header.merkle_root = block.compute_merkle_root().0;
        block
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_block().hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_reward() {
        let params = ChainParams::main();
        assert_eq!(params.block_reward(0), 50 * COIN);
    }

    #[test]
    fn test_halvings() {
        let params = ChainParams::main();
        assert_eq!(params.block_reward(params.halving_interval), 25 * COIN);
        assert_eq!(params.block_reward(params.halving_interval * 2), 12 * COIN + COIN / 2);
        assert_eq!(params.block_reward(params.halving_interval * 64), 0);
    }

    #[test]
    fn test_total_supply_below_max_money() {
        let params = ChainParams::main();
        let mut total: u64 = 0;
        let mut height: u64 = 0;
        loop {
            let reward = params.block_reward(height);
            if reward == 0 {
                break;
            }
            let epoch_end = ((height / params.halving_interval) + 1) * params.halving_interval;
            total = total.saturating_add(reward.saturating_mul(epoch_end - height));
            height = epoch_end;
        }
        assert!(total <= MAX_MONEY);
    }

    #[test]
    fn test_genesis_is_stable_and_committed() {
        for params in [ChainParams::main(), ChainParams::testnet(), ChainParams::regtest()] {
            let genesis = params.genesis_block();
            assert_eq!(genesis.hash(), params.genesis_hash());
            assert_eq!(genesis.header.merkle_root, genesis.compute_merkle_root().0);
        }
        assert_ne!(ChainParams::main().genesis_hash(), ChainParams::regtest().genesis_hash());
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Main);
        assert!("moon".parse::<Network>().is_err());
    }

    #[test]
    fn test_signalling_version() {
        let v = ChainParams::regtest().signalling_version();
        assert_eq!(v & VERSIONBITS_TOP_MASK, VERSIONBITS_TOP_BITS);
        assert_eq!(v & 1, 1);
    }

    #[test]
    fn test_ruleset_for_height() {
        let params = ChainParams::regtest();
        let genesis = params.ruleset_for_height(0, |_| true);
        assert!(!genesis.height_in_coinbase);
        assert!(genesis.median_time_locktime);

        let later = params.ruleset_for_height(10, |_| false);
        assert!(later.height_in_coinbase);
        assert!(!later.median_time_locktime);
        assert_eq!(later.min_block_version(), 2);
    }
}
