//! Minimal script validation.
//!
//! Three locking script shapes are understood:
//!   P2PKH:   OP_DUP OP_HASH256 OP_PUSHDATA1 32 <pubkey_hash32> OP_EQUALVERIFY OP_CHECKSIG
//!            unlocked by OP_PUSHDATA1 64 <sig64> OP_PUSHDATA1 32 <pubkey32>
//!   OP_TRUE: anyone can spend, unlocking script must be empty
//!   OP_RETURN ...: provably unspendable, never enters the coin set
use crate::core::types::{Hash256, Transaction, TxOutput};
use crate::crypto;

pub const OP_TRUE: u8 = 0x51;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH256: u8 = 0xAA;
pub const OP_CHECKSIG: u8 = 0xAC;
pub const OP_PUSHDATA1: u8 = 0x4c;

const P2PKH_LEN: usize = 38;
const P2PKH_SIG_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("non-standard locking script")]
    NonStandard,
    #[error("unspendable output")]
    Unspendable,
    #[error("malformed unlocking script")]
    BadEncoding,
    #[error("public key does not match locking script")]
    PubkeyHashMismatch,
    #[error("signature verification failed")]
    BadSignature,
}

/// Signature verification seam, lets callers put a cache in front of Ed25519.
pub trait SignatureChecker {
    fn check(&self, pubkey: &[u8; 32], sighash: &Hash256, sig: &[u8; 64]) -> bool;
}

/// Verifies every signature from scratch.
pub struct PlainChecker;

impl SignatureChecker for PlainChecker {
    fn check(&self, pubkey: &[u8; 32], sighash: &Hash256, sig: &[u8; 64]) -> bool {
        crypto::verify_signature(pubkey, sighash, sig)
    }
}

pub fn script_p2pkh(pubkey_hash: &Hash256) -> Vec<u8> {
    let mut s = Vec::with_capacity(P2PKH_LEN);
    s.push(OP_DUP);
    s.push(OP_HASH256);
    s.push(OP_PUSHDATA1);
    s.push(32);
    s.extend_from_slice(pubkey_hash);
    s.push(OP_EQUALVERIFY);
    s.push(OP_CHECKSIG);
    s
}

pub fn script_op_true() -> Vec<u8> {
    vec![OP_TRUE]
}

/// Data carrier output, never spendable.
pub fn script_op_return(data: &[u8]) -> Vec<u8> {
    let mut s = vec![OP_RETURN];
    s.extend_from_slice(data);
    s
}

pub fn script_sig_p2pkh(sig64: &[u8; 64], pubkey32: &[u8; 32]) -> Vec<u8> {
    let mut s = Vec::with_capacity(P2PKH_SIG_LEN);
    s.push(OP_PUSHDATA1);
    s.push(64);
    s.extend_from_slice(sig64);
    s.push(OP_PUSHDATA1);
    s.push(32);
    s.extend_from_slice(pubkey32);
    s
}

pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN)
}

pub fn parse_script_sig_p2pkh(script_sig: &[u8]) -> Result<([u8; 64], [u8; 32]), ScriptError> {
    if script_sig.len() != P2PKH_SIG_LEN
        || script_sig[0] != OP_PUSHDATA1
        || script_sig[1] != 64
        || script_sig[66] != OP_PUSHDATA1
        || script_sig[67] != 32
    {
        return Err(ScriptError::BadEncoding);
    }

    let mut sig = [0u8; 64];
    sig.copy_from_slice(&script_sig[2..66]);
    let mut pk = [0u8; 32];
    pk.copy_from_slice(&script_sig[68..100]);
    Ok((sig, pk))
}

pub fn parse_script_pubkey_p2pkh(script_pubkey: &[u8]) -> Option<Hash256> {
    if script_pubkey.len() != P2PKH_LEN
        || script_pubkey[0] != OP_DUP
        || script_pubkey[1] != OP_HASH256
        || script_pubkey[2] != OP_PUSHDATA1
        || script_pubkey[3] != 32
        || script_pubkey[36] != OP_EQUALVERIFY
        || script_pubkey[37] != OP_CHECKSIG
    {
        return None;
    }
    let mut h = [0u8; 32];
    h.copy_from_slice(&script_pubkey[4..36]);
    Some(h)
}

/// Check that input `input_index` of `tx` satisfies the locking script of
/// the coin it spends.
pub fn verify_spend(
    tx: &Transaction,
    input_index: usize,
    prev_output: &TxOutput,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    let input = tx.inputs.get(input_index).ok_or(ScriptError::BadEncoding)?;
    let lock = &prev_output.script_pubkey;

    if is_unspendable(lock) {
        return Err(ScriptError::Unspendable);
    }

    if lock.as_slice() == [OP_TRUE] {
        return if input.script_sig.is_empty() { Ok(()) } else { Err(ScriptError::BadEncoding) };
    }

    let lock_hash = parse_script_pubkey_p2pkh(lock).ok_or(ScriptError::NonStandard)?;
    let (sig64, pubkey32) = parse_script_sig_p2pkh(&input.script_sig)?;

    if crypto::pubkey_hash(&pubkey32) != lock_hash {
        return Err(ScriptError::PubkeyHashMismatch);
    }

    let sighash = crypto::signature_hash(tx, input_index, prev_output);
    if !checker.check(&pubkey32, &sighash, &sig64) {
        return Err(ScriptError::BadSignature);
    }
    Ok(())
}

/// Sign input `input_index` of `tx` spending a P2PKH `prev_output`.
pub fn sign_p2pkh_input(tx: &mut Transaction, input_index: usize, prev_output: &TxOutput, key: &crypto::Keypair) {
    let sighash = crypto::signature_hash(tx, input_index, prev_output);
    let sig = key.sign_hash(&sighash);
    if let Some(input) = tx.inputs.get_mut(input_index) {
        input.script_sig = script_sig_p2pkh(&sig, &key.public_key_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutPoint, TxInput};

    fn spend_of(prev: &TxOutput) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new([3u8; 32], 1),
                script_sig: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { amount: prev.amount - 1, script_pubkey: script_op_true() }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_p2pkh_roundtrip() {
        let key = crypto::Keypair::generate();
        let prev = TxOutput { amount: 1000, script_pubkey: script_p2pkh(&key.pubkey_hash()) };
        let mut tx = spend_of(&prev);
        sign_p2pkh_input(&mut tx, 0, &prev, &key);
        assert_eq!(verify_spend(&tx, 0, &prev, &PlainChecker), Ok(()));
    }

    #[test]
    fn test_p2pkh_wrong_key() {
        let owner = crypto::Keypair::generate();
        let thief = crypto::Keypair::generate();
        let prev = TxOutput { amount: 1000, script_pubkey: script_p2pkh(&owner.pubkey_hash()) };
        let mut tx = spend_of(&prev);
        sign_p2pkh_input(&mut tx, 0, &prev, &thief);
        assert_eq!(verify_spend(&tx, 0, &prev, &PlainChecker), Err(ScriptError::PubkeyHashMismatch));
    }

    #[test]
    fn test_p2pkh_tampered_output() {
        let key = crypto::Keypair::generate();
        let prev = TxOutput { amount: 1000, script_pubkey: script_p2pkh(&key.pubkey_hash()) };
        let mut tx = spend_of(&prev);
        sign_p2pkh_input(&mut tx, 0, &prev, &key);
        tx.outputs[0].amount -= 1;
        assert_eq!(verify_spend(&tx, 0, &prev, &PlainChecker), Err(ScriptError::BadSignature));
    }

    #[test]
    fn test_op_true_and_op_return() {
        let anyone = TxOutput { amount: 10, script_pubkey: script_op_true() };
        let tx = spend_of(&anyone);
        assert!(verify_spend(&tx, 0, &anyone, &PlainChecker).is_ok());

        let burn = TxOutput { amount: 10, script_pubkey: script_op_return(b"data") };
        assert!(is_unspendable(&burn.script_pubkey));
        assert_eq!(verify_spend(&tx, 0, &burn, &PlainChecker), Err(ScriptError::Unspendable));
    }

    #[test]
    fn test_unknown_script_is_rejected() {
        let odd = TxOutput { amount: 10, script_pubkey: vec![0x00, 0x01] };
        let tx = spend_of(&odd);
        assert_eq!(verify_spend(&tx, 0, &odd, &PlainChecker), Err(ScriptError::NonStandard));
    }
}
