use crate::core::types::{Hash256, Transaction};

use super::double_sha256;

fn encode(tx: &Transaction, tag: &[u8], with_script_sig: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(tag);

    buf.extend_from_slice(&tx.version.to_le_bytes());

    buf.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for i in &tx.inputs {
        buf.extend_from_slice(&i.previous_output.txid);
        buf.extend_from_slice(&i.previous_output.vout.to_le_bytes());
        buf.extend_from_slice(&i.sequence.to_le_bytes());
        if with_script_sig {
            buf.extend_from_slice(&(i.script_sig.len() as u32).to_le_bytes());
            buf.extend_from_slice(&i.script_sig);
        }
    }

    buf.extend_from_slice(&(tx.outputs.len() as u32).to_le_bytes());
    for o in &tx.outputs {
        buf.extend_from_slice(&o.amount.to_le_bytes());
        buf.extend_from_slice(&(o.script_pubkey.len() as u32).to_le_bytes());
        buf.extend_from_slice(&o.script_pubkey);
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf
}

/// TXID over everything except unlocking scripts, so re-signing an input
/// never changes the id other transactions refer to.
///
/// The coinbase is the exception: its script_sig carries the height and extra
/// nonce, so it is committed to here.
pub fn txid(tx: &Transaction) -> Hash256 {
    double_sha256(&encode(tx, b"CHAIND_TXID_V1", tx.is_coinbase()))
}

/// WTXID includes unlocking scripts.
pub fn wtxid(tx: &Transaction) -> Hash256 {
    double_sha256(&encode(tx, b"CHAIND_WTXID_V1", true))
}
