use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{self, txid};

/// A 32-byte hash used throughout the system
pub type Hash256 = [u8; 32];

/// Null hash (all zeros) used for genesis block's prev_hash and coinbase inputs
pub const NULL_HASH: Hash256 = [0u8; 32];

/// Sequence value that opts an input out of lock-time enforcement
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Lock times below this are block heights, above are unix timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

// ─── Transaction Types ───────────────────────────────────────────────

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub const fn new(txid: Hash256, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// The outpoint carried by a coinbase input
    pub const fn null() -> Self {
        OutPoint { txid: NULL_HASH, vout: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.txid == NULL_HASH && self.vout == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.vout)
    }
}

/// Transaction input - spends a previous output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// Transaction output - creates a new spendable output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: u64,
    pub script_pubkey: Vec<u8>,
}

/// A complete transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Create a coinbase transaction paying `reward` to `script_pubkey`.
    ///
    /// The unlocking script starts with the little-endian block height, which
    /// keeps coinbase txids unique across heights. `extra_nonce` is appended
    /// after it so miners can vary the merkle root.
    pub fn new_coinbase(height: u64, reward: u64, script_pubkey: Vec<u8>, extra_nonce: &[u8]) -> Self {
        let mut script_sig = height.to_le_bytes().to_vec();
        script_sig.extend_from_slice(extra_nonce);

        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOutput { amount: reward, script_pubkey }],
            lock_time: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of all output amounts, `None` on overflow.
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }

    /// Transaction id. Excludes unlocking scripts.
    pub fn txid(&self) -> Hash256 {
        txid::txid(self)
    }

    /// Witness-inclusive id, covers unlocking scripts too.
    pub fn wtxid(&self) -> Hash256 {
        txid::wtxid(self)
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Strict decode: size-limited, trailing bytes rejected.
    pub fn from_bytes(bytes: &[u8], limit: usize) -> Result<Self, bincode::Error> {
        decode_options(limit).deserialize(bytes)
    }
}

// ─── Block Types ─────────────────────────────────────────────────────

/// Block header
///
/// `difficulty_target` is the number of leading zero BITS required in the
/// block hash. Each extra bit doubles the expected work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u64,
    /// Number of leading zero bits required in the block hash
    pub difficulty_target: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub const ENCODED_LEN: usize = 4 + 32 + 32 + 8 + 4 + 8;

    /// Fixed-width little-endian encoding hashed for the block id.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prev_hash);
        buf[36..68].copy_from_slice(&self.merkle_root);
        buf[68..76].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[76..80].copy_from_slice(&self.difficulty_target.to_le_bytes());
        buf[80..88].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Block id and proof-of-work hash (double SHA-256 of the header).
    pub fn hash(&self) -> Hash256 {
        crypto::double_sha256(&self.encode())
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block [{}] prev={} diff={} ts={}",
            hex::encode(self.hash()),
            hex::encode(&self.prev_hash[..8]),
            self.difficulty_target,
            self.timestamp,
        )
    }
}

/// A complete block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Merkle root over the wtxids, so the header commits to unlocking
    /// scripts too. The flag reports a duplicated sibling pair, which lets two
    /// different transaction lists share one root.
    pub fn compute_merkle_root(&self) -> (Hash256, bool) {
        merkle_root(self.transactions.iter().map(|tx| tx.wtxid()).collect())
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Strict decode: size-limited, trailing bytes rejected.
    pub fn from_bytes(bytes: &[u8], limit: usize) -> Result<Self, bincode::Error> {
        decode_options(limit).deserialize(bytes)
    }
}

/// Bitcoin-style merkle tree: odd levels duplicate their last hash.
pub fn merkle_root(mut hashes: Vec<Hash256>) -> (Hash256, bool) {
    if hashes.is_empty() {
        return (NULL_HASH, false);
    }

    let mut mutated = false;
    while hashes.len() > 1 {
        for pair in hashes.chunks(2) {
            if pair.len() == 2 && pair[0] == pair[1] {
                mutated = true;
            }
        }
        if hashes.len() % 2 != 0 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(&pair[0]);
                combined[32..].copy_from_slice(&pair[1]);
                crypto::double_sha256(&combined)
            })
            .collect();
    }

    (hashes[0], mutated)
}

fn decode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(limit as u64)
}
