//! Cryptographic primitives: double SHA-256 hashing and Ed25519 signatures.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::core::types::{Hash256, Transaction, TxOutput};

pub mod txid;

/// Holds an Ed25519 signing key and its verifying key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(&self.public_key_bytes())
    }

    pub fn sign_hash(&self, hash: &Hash256) -> [u8; 64] {
        self.signing_key.sign(hash).to_bytes()
    }
}

/// Verify an Ed25519 signature over a 32-byte message hash.
pub fn verify_signature(pubkey: &[u8; 32], msg: &Hash256, signature: &[u8; 64]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    vk.verify(msg, &sig).is_ok()
}

/// Double-SHA256 of a public key, committed to by P2PKH outputs.
pub fn pubkey_hash(pubkey: &[u8]) -> Hash256 {
    double_sha256(pubkey)
}

pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Signing hash for one transaction input.
///
/// Explicit, stable encoding with a domain tag. Commits to every outpoint and
/// sequence, every output, and to the amount and locking script of the coin
/// the signed input spends.
pub fn signature_hash(tx: &Transaction, input_index: usize, prev_output: &TxOutput) -> Hash256 {
    const TAG: &[u8] = b"CHAIND_SIGHASH_V1";

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(TAG);
    buf.extend_from_slice(&tx.version.to_le_bytes());

    buf.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for (i, input) in tx.inputs.iter().enumerate() {
        buf.extend_from_slice(&input.previous_output.txid);
        buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
        buf.extend_from_slice(&input.sequence.to_le_bytes());

        if i == input_index {
            buf.extend_from_slice(&prev_output.amount.to_le_bytes());
            buf.extend_from_slice(&(prev_output.script_pubkey.len() as u32).to_le_bytes());
            buf.extend_from_slice(&prev_output.script_pubkey);
        }
    }

    buf.extend_from_slice(&(tx.outputs.len() as u32).to_le_bytes());
    for o in &tx.outputs {
        buf.extend_from_slice(&o.amount.to_le_bytes());
        buf.extend_from_slice(&(o.script_pubkey.len() as u32).to_le_bytes());
        buf.extend_from_slice(&o.script_pubkey);
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    double_sha256(&buf)
}
