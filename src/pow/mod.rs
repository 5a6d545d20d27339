//! Proof-of-work: leading-zero-bit targets, chain work and LWMA retargeting.
//!
//! Difficulty is counted in leading zero bits of the double-SHA256 header
//! hash, so each extra bit doubles the expected work. Retargeting runs a
//! linearly weighted moving average over the last `DIFFICULTY_WINDOW` solve
//! times and keeps a fractional difficulty in milli-bits per block, which is
//! rounded to whole bits for the next header.

use num_bigint::BigUint;
use num_traits::One;

use crate::core::params::{ChainParams, MEDIAN_TIME_SPAN};
use crate::core::types::Hash256;

/// Number of solve times the LWMA looks at
pub const DIFFICULTY_WINDOW: usize = 60;

/// Largest per-block step of the fractional difficulty, in milli-bits
const MAX_ADJUSTMENT_MILLI: i64 = 500;

/// 1000 / ln(2), turns a relative solve-time error into milli-bits
const MILLI_BITS_PER_UNIT: i64 = 1443;

/// Count leading zero bits in a hash
pub fn leading_zero_bits(hash: &Hash256) -> u32 {
    let mut count = 0u32;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

pub fn check_proof_of_work(hash: &Hash256, difficulty_bits: u32) -> bool {
    leading_zero_bits(hash) >= difficulty_bits
}

/// Expected number of hashes to find a block at this difficulty.
pub fn block_work(difficulty_bits: u32) -> BigUint {
    BigUint::one() << difficulty_bits as usize
}

/// Whether a header's difficulty is acceptable given what the chain requires.
pub fn difficulty_acceptable(bits: u32, required: u32, params: &ChainParams) -> bool {
    if params.pow_no_retargeting {
        bits >= params.min_difficulty && bits <= params.max_difficulty
    } else {
        bits == required
    }
}

/// Next fractional difficulty (milli-bits) given the current one and the
/// timestamps of the most recent blocks, oldest first.
pub fn next_difficulty_milli(current_milli: u32, timestamps: &[u64], params: &ChainParams) -> u32 {
    let n = timestamps.len();
    if n < 2 || params.pow_no_retargeting {
        return current_milli;
    }

    let window = n.min(DIFFICULTY_WINDOW);
    let start = n - window;
    let target = params.target_block_time.max(1) as i64;

    let mut weighted_sum: i64 = 0;
    let mut weight_total: i64 = 0;
    for i in 1..window {
        let solve_time = timestamps[start + i] as i64 - timestamps[start + i - 1] as i64;
        let clamped = solve_time.clamp(1, target * 6);
        weighted_sum += clamped * i as i64;
        weight_total += i as i64;
    }
    if weight_total == 0 {
        return current_milli;
    }

    // log2(target / avg) linearised around avg == target
    let raw_adj = (target * weight_total - weighted_sum) * MILLI_BITS_PER_UNIT / weighted_sum;
    let max_adj = MAX_ADJUSTMENT_MILLI * (window as i64 - 1) / DIFFICULTY_WINDOW as i64;
    let adj = raw_adj.clamp(-max_adj, max_adj);

    let low = params.min_difficulty as i64 * 1000;
    let high = params.max_difficulty as i64 * 1000;
    (current_milli as i64 + adj).clamp(low, high) as u32
}

/// Round a fractional difficulty to the whole-bit target a header must carry.
pub fn milli_to_bits(milli: u32, params: &ChainParams) -> u32 {
    ((milli + 500) / 1000).clamp(params.min_difficulty, params.max_difficulty)
}

/// Median of up to `MEDIAN_TIME_SPAN` timestamps.
pub fn median_time(timestamps: &[u64]) -> u64 {
    let mut window: Vec<u64> = timestamps.iter().rev().take(MEDIAN_TIME_SPAN).copied().collect();
    if window.is_empty() {
        return 0;
    }
    window.sort_unstable();
    window[window.len() / 2]
}
