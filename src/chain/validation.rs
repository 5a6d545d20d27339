//! Consensus checks for transactions and blocks.
//!
//! Context-free checks need nothing but the object itself. Contextual checks
//! need the parent entry and the rules in force. `connect_block` applies a
//! block to a coins view, verifying every input and queueing its scripts.

use std::sync::Arc;

use crate::core::params::{
    ChainParams, RuleSet, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_SIZE, MAX_FUTURE_BLOCK_TIME, MAX_MONEY,
    MAX_SCRIPT_SIZE, MAX_TXS_PER_BLOCK, MAX_TX_SIZE, MIN_COINBASE_SCRIPT_SIZE,
};
use crate::core::types::{Block, BlockHeader, OutPoint, Transaction, LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
use crate::pow;

use super::checkqueue::{CheckQueue, ScriptCheck};
use super::coins::{Coin, CoinsCache, CoinsError, CoinsView};
use super::error::{ChainStateError, ValidationError};
use super::index::BlockIndexEntry;
use super::undo::{BlockUndo, TxUndo};

// ─── Context-free Checks ─────────────────────────────────────────────

pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.inputs.is_empty() {
        return Err(ValidationError::malformed("bad-txns-vin-empty"));
    }
    if tx.outputs.is_empty() {
        return Err(ValidationError::malformed("bad-txns-vout-empty"));
    }
    if tx.size() > MAX_TX_SIZE {
        return Err(ValidationError::malformed("bad-txns-oversize"));
    }

    let mut total: u64 = 0;
    for output in &tx.outputs {
        if output.amount > MAX_MONEY {
            return Err(ValidationError::malformed("bad-txns-vout-toolarge"));
        }
        total = total
            .checked_add(output.amount)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or_else(|| ValidationError::malformed("bad-txns-txouttotal-toolarge"))?;
        if output.script_pubkey.len() > MAX_SCRIPT_SIZE {
            return Err(ValidationError::malformed("bad-txns-script-size"));
        }
    }

    let mut seen = std::collections::HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.previous_output) {
            return Err(ValidationError::malformed("bad-txns-inputs-duplicate"));
        }
        if input.script_sig.len() > MAX_SCRIPT_SIZE {
            return Err(ValidationError::malformed("bad-txns-script-size"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(ValidationError::malformed("bad-cb-length"));
        }
    } else if tx.inputs.iter().any(|i| i.previous_output.is_null()) {
        return Err(ValidationError::malformed("bad-txns-prevout-null"));
    }
    Ok(())
}

/// Proof of work. The genesis header is accepted by identity instead.
pub fn check_block_header(header: &BlockHeader, params: &ChainParams) -> Result<(), ValidationError> {
    let hash = header.hash();
    if hash == params.genesis_hash() {
        return Ok(());
    }
    if !pow::check_proof_of_work(&hash, header.difficulty_target) {
        return Err(ValidationError::malformed("high-hash"));
    }
    Ok(())
}

/// Whether the body fails to match its header in a way that says nothing
/// about the header itself: a wrong merkle root or a duplicated-subtree
/// mutation. Such a body must not get the block marked invalid.
pub fn is_mutated(block: &Block) -> bool {
    let (root, mutated) = block.compute_merkle_root();
    mutated || root != block.header.merkle_root
}

pub fn check_block(block: &Block, params: &ChainParams) -> Result<(), ValidationError> {
    check_block_header(&block.header, params)?;

    let (root, mutated) = block.compute_merkle_root();
    if root != block.header.merkle_root {
        return Err(ValidationError::malformed("bad-txnmrklroot"));
    }
    if mutated {
        return Err(ValidationError::malformed("bad-txns-duplicate"));
    }

    if block.transactions.is_empty()
        || block.transactions.len() > MAX_TXS_PER_BLOCK
        || block.size() > MAX_BLOCK_SIZE
    {
        return Err(ValidationError::malformed("bad-blk-length"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::malformed("bad-cb-missing"));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ValidationError::malformed("bad-cb-multiple"));
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }
    Ok(())
}

// ─── Contextual Checks ───────────────────────────────────────────────

/// Header rules that depend on the parent. `now` is omitted when a stored
/// block is re-validated, since the future-time limit only applies on arrival.
pub fn contextual_check_block_header(
    header: &BlockHeader,
    parent: &BlockIndexEntry,
    rules: &RuleSet,
    now: Option<u64>,
    params: &ChainParams,
) -> Result<(), ValidationError> {
    let required = pow::milli_to_bits(parent.next_difficulty_milli, params);
    if !pow::difficulty_acceptable(header.difficulty_target, required, params) {
        return Err(ValidationError::invalid("bad-diffbits"));
    }
    if header.timestamp <= parent.median_time_past {
        return Err(ValidationError::invalid("time-too-old"));
    }
    if let Some(now) = now {
        if header.timestamp > now + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationError::invalid("time-too-new"));
        }
    }
    if header.version < rules.min_block_version() {
        return Err(ValidationError::invalid(format!("bad-version(0x{:08x})", header.version)));
    }
    Ok(())
}

pub fn contextual_check_block(
    block: &Block,
    height: u64,
    parent_median_time: u64,
    rules: &RuleSet,
) -> Result<(), ValidationError> {
    let cutoff = if rules.median_time_locktime { parent_median_time } else { block.header.timestamp };
    for tx in &block.transactions {
        if !is_final_tx(tx, height, cutoff) {
            return Err(ValidationError::invalid("bad-txns-nonfinal"));
        }
    }

    if rules.height_in_coinbase {
        let expected = height.to_le_bytes();
        let starts_with_height = block
            .transactions
            .first()
            .and_then(|cb| cb.inputs.first())
            .is_some_and(|input| input.script_sig.starts_with(&expected));
        if !starts_with_height {
            return Err(ValidationError::invalid("bad-cb-height"));
        }
    }
    Ok(())
}

/// A transaction is final once its lock time has passed, or when every
/// input has opted out with a final sequence number.
pub fn is_final_tx(tx: &Transaction, height: u64, block_time: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { block_time };
    if (tx.lock_time as u64) < limit {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// Check that every input of a non-coinbase transaction is spendable at
/// `spend_height` and that the inputs cover the outputs. Returns the fee.
pub fn check_tx_inputs<V: CoinsView + ?Sized>(
    tx: &Transaction,
    view: &V,
    spend_height: u64,
    coinbase_maturity: u64,
) -> Result<u64, ChainStateError> {
    let mut value_in: u64 = 0;
    for input in &tx.inputs {
        let coin = view
            .get_coin(&input.previous_output)?
            .ok_or_else(|| ValidationError::invalid("bad-txns-inputs-missingorspent"))?;
        if coin.is_coinbase && spend_height.saturating_sub(coin.height) < coinbase_maturity {
            return Err(ValidationError::invalid(format!(
                "bad-txns-premature-spend-of-coinbase, tried to spend coinbase at depth {}",
                spend_height.saturating_sub(coin.height)
            ))
            .into());
        }
        value_in = value_in
            .checked_add(coin.output.amount)
            .filter(|v| *v <= MAX_MONEY)
            .ok_or_else(|| ValidationError::invalid("bad-txns-inputvalues-outofrange"))?;
    }

    let value_out = tx
        .total_output()
        .ok_or_else(|| ValidationError::malformed("bad-txns-txouttotal-toolarge"))?;
    if value_in < value_out {
        return Err(ValidationError::invalid(format!(
            "bad-txns-in-belowout, value in ({}) < value out ({})",
            value_in, value_out
        ))
        .into());
    }
    Ok(value_in - value_out)
}

// ─── Block Connection ────────────────────────────────────────────────

/// Apply `block` at `height` to `view`, returning its undo record.
///
/// On error the view is left partially modified; callers connect against a
/// scratch layer and drop it on failure.
pub fn connect_block<B: CoinsView>(
    block: &Block,
    height: u64,
    view: &mut CoinsCache<B>,
    params: &ChainParams,
    queue: &CheckQueue,
) -> Result<BlockUndo, ChainStateError> {
    let mut control = queue.control();
    let mut undo = BlockUndo { txs: Vec::with_capacity(block.transactions.len().saturating_sub(1)) };
    let mut fees: u64 = 0;

    for tx in &block.transactions {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();

        if !is_coinbase {
            let fee = check_tx_inputs(tx, &*view, height, params.coinbase_maturity)?;
            fees = fees
                .checked_add(fee)
                .filter(|f| *f <= MAX_MONEY)
                .ok_or_else(|| ValidationError::invalid("bad-txns-accumulated-fee-outofrange"))?;

            let shared = Arc::new(tx.clone());
            let mut checks = Vec::with_capacity(tx.inputs.len());
            let mut spent = Vec::with_capacity(tx.inputs.len());
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let coin = view.spend_coin(&input.previous_output).map_err(|e| match e {
                    CoinsError::MissingOrSpent(_) => ValidationError::invalid("bad-txns-inputs-missingorspent").into(),
                    other => ChainStateError::from(other),
                })?;
                checks.push(ScriptCheck { tx: shared.clone(), input_index, prev_output: coin.output.clone() });
                spent.push(coin);
            }
            control.add(checks);
            undo.txs.push(TxUndo { spent });
        }

        for (vout, output) in tx.outputs.iter().enumerate() {
            let coin = Coin { output: output.clone(), height, is_coinbase };
            view.add_coin(OutPoint::new(txid, vout as u32), coin, false).map_err(|e| match e {
                CoinsError::Duplicate(_) => ValidationError::invalid("bad-txns-BIP30").into(),
                other => ChainStateError::from(other),
            })?;
        }
    }

    let claimed = block.transactions[0].total_output().unwrap_or(u64::MAX);
    let allowed = params.block_reward(height).saturating_add(fees);
    if claimed > allowed {
        return Err(ValidationError::invalid(format!(
            "bad-cb-amount, coinbase pays too much (actual={} vs limit={})",
            claimed, allowed
        ))
        .into());
    }

    control
        .wait()
        .map_err(|e| ValidationError::invalid(format!("mandatory-script-verify-flag-failed ({})", e)))?;
    Ok(undo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::coins::CoinsDb;
    use crate::chain::sigcache::SignatureCache;
    use crate::chain::undo::{disconnect_block, DisconnectResult};
    use crate::core::script;
    use crate::core::types::{TxInput, TxOutput};
    use crate::crypto::Keypair;
    use crate::storage::MemoryStore;

    fn params() -> ChainParams {
        let mut params = ChainParams::regtest();
        params.coinbase_maturity = 2;
        params
    }

    fn spend(prev: OutPoint, amounts: &[u64]) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput { previous_output: prev, script_sig: vec![], sequence: SEQUENCE_FINAL }],
            outputs: amounts
                .iter()
                .map(|&amount| TxOutput { amount, script_pubkey: script::script_op_true() })
                .collect(),
            lock_time: 0,
        }
    }

    fn block(height: u64, reward: u64, mut txs: Vec<Transaction>) -> Block {
        let coinbase = Transaction::new_coinbase(height, reward, script::script_op_true(), b"");
        txs.insert(0, coinbase);
        let mut block = Block {
            header: BlockHeader {
                version: 2,
                prev_hash: [height as u8; 32],
                merkle_root: [0u8; 32],
                timestamp: 1_000 + height,
                difficulty_target: 0,
                nonce: 0,
            },
            transactions: txs,
        };
        block.header.merkle_root = block.compute_merkle_root().0;
        block
    }

    fn view_with(coins: &[(OutPoint, Coin)]) -> CoinsCache<CoinsDb> {
        let mut view = CoinsCache::new(CoinsDb::new(Arc::new(MemoryStore::new()), 100));
        for (op, coin) in coins {
            view.add_coin(*op, coin.clone(), false).unwrap();
        }
        view
    }

    fn coin(amount: u64, height: u64, is_coinbase: bool) -> Coin {
        Coin { output: TxOutput { amount, script_pubkey: script::script_op_true() }, height, is_coinbase }
    }

    fn queue() -> CheckQueue {
        CheckQueue::new(0, 8, Arc::new(SignatureCache::new(1 << 16)))
    }

    fn reason(err: ChainStateError) -> String {
        match err {
            ChainStateError::Validation(v) => v.reason(),
            other => panic!("unexpected error {other}"),
        }
    }

    // ─── Context-free ────────────────────────────────────────────────

    #[test]
    fn test_check_transaction_rejects() {
        let good = spend(OutPoint::new([1u8; 32], 0), &[10]);
        assert!(check_transaction(&good).is_ok());

        let mut t = good.clone();
        t.inputs.clear();
        assert_eq!(check_transaction(&t).unwrap_err().reason(), "bad-txns-vin-empty");

        let mut t = good.clone();
        t.outputs.clear();
        assert_eq!(check_transaction(&t).unwrap_err().reason(), "bad-txns-vout-empty");

        let mut t = good.clone();
        t.outputs[0].amount = MAX_MONEY + 1;
        assert_eq!(check_transaction(&t).unwrap_err().reason(), "bad-txns-vout-toolarge");

        let t = spend(OutPoint::new([1u8; 32], 0), &[MAX_MONEY, 1]);
        assert_eq!(check_transaction(&t).unwrap_err().reason(), "bad-txns-txouttotal-toolarge");

        let mut t = good.clone();
        t.inputs.push(t.inputs[0].clone());
        assert_eq!(check_transaction(&t).unwrap_err().reason(), "bad-txns-inputs-duplicate");

        let mut t = good.clone();
        t.inputs.push(TxInput { previous_output: OutPoint::null(), script_sig: vec![], sequence: 0 });
        assert_eq!(check_transaction(&t).unwrap_err().reason(), "bad-txns-prevout-null");
    }

    #[test]
    fn test_coinbase_script_length() {
        let mut cb = Transaction::new_coinbase(1, 50, script::script_op_true(), b"");
        assert!(check_transaction(&cb).is_ok());
        cb.inputs[0].script_sig = vec![1, 2];
        assert_eq!(check_transaction(&cb).unwrap_err().reason(), "bad-cb-length");
        cb.inputs[0].script_sig = vec![0; MAX_COINBASE_SCRIPT_SIZE + 1];
        assert_eq!(check_transaction(&cb).unwrap_err().reason(), "bad-cb-length");
    }

    #[test]
    fn test_check_block_structure() {
        let params = params();
        let b = block(1, 50, vec![spend(OutPoint::new([1u8; 32], 0), &[5])]);
        assert!(check_block(&b, &params).is_ok());
        assert!(!is_mutated(&b));

        let mut bad_root = b.clone();
        bad_root.header.merkle_root = [9u8; 32];
        assert_eq!(check_block(&bad_root, &params).unwrap_err().reason(), "bad-txnmrklroot");
        assert!(is_mutated(&bad_root));

        let mut no_cb = b.clone();
        no_cb.transactions.remove(0);
        no_cb.header.merkle_root = no_cb.compute_merkle_root().0;
        assert_eq!(check_block(&no_cb, &params).unwrap_err().reason(), "bad-cb-missing");

        let mut two_cb = b.clone();
        two_cb.transactions.push(Transaction::new_coinbase(1, 1, script::script_op_true(), b"x"));
        two_cb.header.merkle_root = two_cb.compute_merkle_root().0;
        assert_eq!(check_block(&two_cb, &params).unwrap_err().reason(), "bad-cb-multiple");
    }

    #[test]
    fn test_duplicated_transactions_detected_as_mutation() {
        let params = params();
        let a = spend(OutPoint::new([1u8; 32], 0), &[5]);
        let b = spend(OutPoint::new([2u8; 32], 0), &[5]);
        let honest = block(1, 50, vec![a.clone(), b.clone()]);
        let mut padded = honest.clone();
        padded.transactions.push(b);
        // Same root, but the padded body duplicates a subtree
        assert_eq!(padded.compute_merkle_root().0, honest.header.merkle_root);
        assert!(is_mutated(&padded));
        assert_eq!(check_block(&padded, &params).unwrap_err().reason(), "bad-txns-duplicate");
    }

    #[test]
    fn test_high_hash() {
        let params = params();
        let mut b = block(1, 50, vec![]);
        b.header.difficulty_target = 250;
        assert_eq!(check_block_header(&b.header, &params).unwrap_err().reason(), "high-hash");
        assert!(check_block_header(&ChainParams::main().genesis_block().header, &ChainParams::main()).is_ok());
    }

    // ─── Contextual ──────────────────────────────────────────────────

    #[test]
    fn test_contextual_header_checks() {
        let params = params();
        let mut index = crate::chain::index::BlockIndex::new();
        let gid = index.insert_header(&params.genesis_block().header, &params).unwrap();
        let parent = index.entry(gid).clone();
        let rules = RuleSet { height_in_coinbase: true, median_time_locktime: false };

        let mut header = block(1, 50, vec![]).header;
        header.prev_hash = parent.hash;
        header.timestamp = parent.median_time_past + 1;
        let now = parent.median_time_past;
        assert!(contextual_check_block_header(&header, &parent, &rules, Some(now), &params).is_ok());

        let mut old = header.clone();
        old.timestamp = parent.median_time_past;
        assert_eq!(
            contextual_check_block_header(&old, &parent, &rules, Some(now), &params).unwrap_err().reason(),
            "time-too-old"
        );

        let mut future = header.clone();
        future.timestamp = now + MAX_FUTURE_BLOCK_TIME + 1;
        assert_eq!(
            contextual_check_block_header(&future, &parent, &rules, Some(now), &params).unwrap_err().reason(),
            "time-too-new"
        );
        assert!(contextual_check_block_header(&future, &parent, &rules, None, &params).is_ok());

        let mut v1 = header.clone();
        v1.version = 1;
        assert!(contextual_check_block_header(&v1, &parent, &rules, Some(now), &params).is_err());
        assert!(contextual_check_block_header(&v1, &parent, &RuleSet::default(), Some(now), &params).is_ok());
    }

    #[test]
    fn test_is_final_tx() {
        let mut tx = spend(OutPoint::new([1u8; 32], 0), &[1]);
        assert!(is_final_tx(&tx, 1, 0));

        tx.lock_time = 10;
        tx.inputs[0].sequence = 0;
        assert!(!is_final_tx(&tx, 10, 0));
        assert!(is_final_tx(&tx, 11, 0));

        tx.lock_time = LOCKTIME_THRESHOLD + 100;
        assert!(!is_final_tx(&tx, 1_000_000, (LOCKTIME_THRESHOLD + 100) as u64));
        assert!(is_final_tx(&tx, 1, (LOCKTIME_THRESHOLD + 101) as u64));

        tx.inputs[0].sequence = SEQUENCE_FINAL;
        assert!(is_final_tx(&tx, 1, 0));
    }

    #[test]
    fn test_contextual_block_checks() {
        let rules = RuleSet { height_in_coinbase: true, median_time_locktime: true };
        let good = block(7, 50, vec![]);
        assert!(contextual_check_block(&good, 7, 0, &rules).is_ok());
        assert_eq!(contextual_check_block(&good, 8, 0, &rules).unwrap_err().reason(), "bad-cb-height");
        assert!(contextual_check_block(&good, 8, 0, &RuleSet::default()).is_ok());

        let mut locked = spend(OutPoint::new([1u8; 32], 0), &[1]);
        locked.lock_time = LOCKTIME_THRESHOLD + 500;
        locked.inputs[0].sequence = 0;
        let b = block(7, 50, vec![locked]);
        // Block timestamp is far below the lock time either way
        assert_eq!(contextual_check_block(&b, 7, 0, &rules).unwrap_err().reason(), "bad-txns-nonfinal");
        let mtp = (LOCKTIME_THRESHOLD + 501) as u64;
        assert!(contextual_check_block(&b, 7, mtp, &rules).is_ok());
        assert!(contextual_check_block(&b, 7, mtp, &RuleSet::default()).is_err());
    }

    // ─── Inputs and Connection ───────────────────────────────────────

    #[test]
    fn test_check_tx_inputs() {
        let funding = OutPoint::new([1u8; 32], 0);
        let view = view_with(&[(funding, coin(100, 5, true))]);

        let tx = spend(funding, &[90]);
        let err = check_tx_inputs(&tx, &view, 6, 2).unwrap_err();
        assert!(reason(err).starts_with("bad-txns-premature-spend-of-coinbase"));
        assert_eq!(check_tx_inputs(&tx, &view, 7, 2).unwrap(), 10);

        let greedy = spend(funding, &[101]);
        assert!(reason(check_tx_inputs(&greedy, &view, 7, 2).unwrap_err()).starts_with("bad-txns-in-belowout"));

        let missing = spend(OutPoint::new([2u8; 32], 0), &[1]);
        assert_eq!(reason(check_tx_inputs(&missing, &view, 7, 2).unwrap_err()), "bad-txns-inputs-missingorspent");
    }

    #[test]
    fn test_connect_and_disconnect_round_trip() {
        let params = params();
        let funding = OutPoint::new([1u8; 32], 0);
        let mut view = view_with(&[(funding, coin(100, 1, false))]);
        view.flush().unwrap();
        let before = view.base().all_coins().unwrap();

        let tx = spend(funding, &[60, 30]);
        let child = spend(OutPoint::new(tx.txid(), 1), &[25]);
        let b = block(10, params.block_reward(10) + 15, vec![tx, child]);

        let undo = connect_block(&b, 10, &mut view, &params, &queue()).unwrap();
        assert_eq!(undo.txs.len(), 2);
        assert_eq!(undo.txs[0].spent, vec![coin(100, 1, false)]);
        assert_eq!(view.get_coin(&funding).unwrap(), None);

        let result = disconnect_block(&b, 10, &undo, &mut view).unwrap();
        assert_eq!(result, DisconnectResult::Clean);
        view.flush().unwrap();
        assert_eq!(view.base().all_coins().unwrap(), before);
    }

    #[test]
    fn test_connect_rejects_double_spend_in_block() {
        let params = params();
        let funding = OutPoint::new([1u8; 32], 0);
        let mut view = view_with(&[(funding, coin(100, 1, false))]);
        let b = block(10, 0, vec![spend(funding, &[50]), spend(funding, &[40])]);
        let err = connect_block(&b, 10, &mut view, &params, &queue()).unwrap_err();
        assert_eq!(reason(err), "bad-txns-inputs-missingorspent");
    }

    #[test]
    fn test_connect_rejects_excess_coinbase() {
        let params = params();
        let funding = OutPoint::new([1u8; 32], 0);
        let mut view = view_with(&[(funding, coin(100, 1, false))]);
        let b = block(10, params.block_reward(10) + 11, vec![spend(funding, &[90])]);
        let err = connect_block(&b, 10, &mut view, &params, &queue()).unwrap_err();
        assert!(reason(err).starts_with("bad-cb-amount"));
    }

    #[test]
    fn test_connect_rejects_bad_signature() {
        let params = params();
        let owner = Keypair::generate();
        let thief = Keypair::generate();
        let funding = OutPoint::new([1u8; 32], 0);
        let locked = Coin {
            output: TxOutput { amount: 100, script_pubkey: script::script_p2pkh(&owner.pubkey_hash()) },
            height: 1,
            is_coinbase: false,
        };
        let mut view = view_with(&[(funding, locked.clone())]);

        let mut tx = spend(funding, &[90]);
        script::sign_p2pkh_input(&mut tx, 0, &locked.output, &thief);
        let b = block(10, 0, vec![tx.clone()]);
        let err = connect_block(&b, 10, &mut view, &params, &queue()).unwrap_err();
        assert!(reason(err).starts_with("mandatory-script-verify-flag-failed"));

        let mut view = view_with(&[(funding, locked.clone())]);
        let mut tx = spend(funding, &[90]);
        script::sign_p2pkh_input(&mut tx, 0, &locked.output, &owner);
        let b = block(10, 0, vec![tx]);
        assert!(connect_block(&b, 10, &mut view, &params, &queue()).is_ok());
    }
}
