//! Proof of work: 256-bit target arithmetic, compact encoding, work and retargeting

use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::serialization::block_hash;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 256-bit unsigned integer, four little-endian 64-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct U256([u64; 4]);

impl U256 {
    pub const fn zero() -> Self {
        U256([0; 4])
    }

    pub const fn one() -> Self {
        U256([1, 0, 0, 0])
    }

    pub const fn max_value() -> Self {
        U256([u64::MAX; 4])
    }

    pub const fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    fn bit(&self, index: usize) -> bool {
        (self.0[index / 64] >> (index % 64)) & 1 == 1
    }

    fn set_bit(&mut self, index: usize) {
        self.0[index / 64] |= 1 << (index % 64);
    }

    /// Number of significant bits.
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }

        result
    }

    pub fn not(&self) -> Self {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    pub fn overflowing_add(&self, other: &U256) -> (U256, bool) {
        let mut result = [0u64; 4];
        let mut carry = false;
        for (i, word) in result.iter_mut().enumerate() {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            *word = sum;
            carry = c1 || c2;
        }
        (U256(result), carry)
    }

    pub fn checked_add(&self, other: &U256) -> Option<U256> {
        match self.overflowing_add(other) {
            (sum, false) => Some(sum),
            (_, true) => None,
        }
    }

    /// Addition that pins at the maximum instead of wrapping.
    pub fn saturating_add(&self, other: &U256) -> U256 {
        self.checked_add(other).unwrap_or_else(U256::max_value)
    }

    pub fn wrapping_sub(&self, other: &U256) -> U256 {
        let mut result = [0u64; 4];
        let mut borrow = false;
        for (i, word) in result.iter_mut().enumerate() {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            *word = diff;
            borrow = b1 || b2;
        }
        U256(result)
    }

    pub fn checked_sub(&self, other: &U256) -> Option<U256> {
        if self < other {
            None
        } else {
            Some(self.wrapping_sub(other))
        }
    }

    pub fn checked_mul_u64(&self, factor: u64) -> Option<U256> {
        let mut result = [0u64; 4];
        let mut carry = 0u128;
        for (i, word) in result.iter_mut().enumerate() {
            let product = self.0[i] as u128 * factor as u128 + carry;
            *word = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            None
        } else {
            Some(U256(result))
        }
    }

    /// Binary long division. `None` when dividing by zero.
    pub fn checked_div(&self, divisor: &U256) -> Option<U256> {
        if divisor.is_zero() {
            return None;
        }

        let mut quotient = U256::zero();
        let mut remainder = U256::zero();
        for i in (0..256).rev() {
            let carry = remainder.bit(255);
            remainder = remainder.shl(1);
            if self.bit(i) {
                remainder.0[0] |= 1;
            }
            if carry || remainder >= *divisor {
                remainder = remainder.wrapping_sub(divisor);
                quotient.set_bit(i);
            }
        }
        Some(quotient)
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, &word) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(chunk);
        }
        U256(words)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

/// Decoded compact target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    pub negative: bool,
    pub overflow: bool,
}

/// Expand a compact target.
///
/// The top byte is a base-256 exponent `e`, the low 23 bits a mantissa `m`,
/// bit 23 a sign. The value is `m * 256^(e - 3)`.
pub fn decode_compact(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let target = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from_u64(word as u64)
    } else {
        U256::from_u64(word as u64).shl(8 * (size - 3))
    };
    CompactTarget {
        target,
        negative: word != 0 && (bits & 0x0080_0000) != 0,
        overflow: word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)),
    }
}

/// Compress a target into compact form, rounding down to 23 mantissa bits.
pub fn encode_compact(target: &U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        target.shr(8 * (size - 3)).low_u64() as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Target a compact value denotes, rejecting negative, overflowing, zero
/// or above-limit encodings.
pub fn target_from_bits(bits: u32, params: &ChainParams) -> Result<U256> {
    let decoded = decode_compact(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "invalid compact target 0x{:08x}",
            bits
        )));
    }
    if decoded.target > pow_limit(params) {
        return Err(ConsensusError::ConsensusInvalid(format!(
            "target 0x{:08x} above proof-of-work limit",
            bits
        )));
    }
    Ok(decoded.target)
}

pub fn pow_limit(params: &ChainParams) -> U256 {
    decode_compact(params.pow_limit_bits).target
}

/// CheckProofOfWork: the header hash, read as a little-endian 256-bit
/// number, must not exceed the target its `bits` field declares.
pub fn check_proof_of_work(header: &BlockHeader, params: &ChainParams) -> Result<()> {
    let target = target_from_bits(header.bits, params)?;
    let hash = U256::from_le_bytes(&block_hash(header));
    if hash > target {
        return Err(ConsensusError::ConsensusInvalid(
            "block hash does not meet target".to_string(),
        ));
    }
    Ok(())
}

/// Expected number of hashes needed to meet the target in `bits`:
/// `2^256 / (target + 1)`, computed as `!target / (target + 1) + 1`.
pub fn block_work(bits: u32) -> U256 {
    let decoded = decode_compact(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() {
        return U256::zero();
    }
    let denominator = match decoded.target.checked_add(&U256::one()) {
        Some(d) => d,
        None => return U256::one(),
    };
    decoded
        .target
        .not()
        .checked_div(&denominator)
        .map(|q| q.saturating_add(&U256::one()))
        .unwrap_or_else(U256::zero)
}

/// CalculateNextWorkRequired
///
/// 1. If the chain never retargets: keep `last_bits`
/// 2. actual = last_block_time - first_block_time, clamped to
///    [timespan / 4, timespan * 4]
/// 3. new = target(last_bits) * actual / timespan
/// 4. Return compact(min(new, pow_limit))
pub fn calculate_next_work_required(
    last_bits: u32,
    first_block_time: u32,
    last_block_time: u32,
    params: &ChainParams,
) -> u32 {
    if params.pow_no_retargeting {
        return last_bits;
    }

    let timespan = params.target_timespan as i64;
    let actual = (last_block_time as i64 - first_block_time as i64)
        .clamp(timespan / 4, timespan * 4);

    let limit = pow_limit(params);
    let current = decode_compact(last_bits).target;
    let retargeted = current
        .checked_mul_u64(actual as u64)
        .and_then(|scaled| scaled.checked_div(&U256::from_u64(timespan as u64)))
        .unwrap_or(limit);

    encode_compact(&retargeted.min(limit))
}

/// Whether a block at `height` starts a new retarget window.
pub fn is_retarget_height(height: Height, params: &ChainParams) -> bool {
    height % params.retarget_interval == 0
}
