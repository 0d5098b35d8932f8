//! Difficulty and target arithmetic.
//!
//! Pool difficulty is expressed relative to the classic difficulty-1
//! target (compact bits 0x1d00ffff). Conversions run over 256-bit
//! integers; the fractional part of a difficulty survives via a 2^24
//! fixed-point scale, which is plenty for the sub-1 difficulties used on
//! low-power hardware.

use bitcoin::pow::Target;
use ruint::aliases::U256;

/// The difficulty-1 target, big-endian.
const DIFF1_BYTES: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

const SCALE_BITS: usize = 24;

pub fn diff1() -> U256 {
    U256::from_be_bytes(DIFF1_BYTES)
}

/// Target below which a hash meets `difficulty`.
///
/// Difficulties at or below zero clamp to difficulty 2^-24.
pub fn difficulty_to_target(difficulty: f64) -> U256 {
    let scaled = (difficulty * (1u64 << SCALE_BITS) as f64).max(1.0) as u128;
    (diff1() << SCALE_BITS) / U256::from(scaled)
}

/// Difficulty corresponding to `target` (approximate, f64 precision).
pub fn target_to_difficulty(target: U256) -> f64 {
    Target::from_be_bytes(target.to_be_bytes()).difficulty_float()
}

/// Difficulty achieved by a 32-byte hash in wire (little-endian) order.
pub fn hash_difficulty(hash_le: &[u8; 32]) -> f64 {
    Target::from_le_bytes(*hash_le).difficulty_float()
}

/// Hash value as a 256-bit integer, from wire (little-endian) order.
pub fn hash_value(hash_le: &[u8; 32]) -> U256 {
    U256::from_le_bytes(*hash_le)
}

/// Decode a block target from the hex string in a block template.
pub fn target_from_hex(hex_target: &str) -> Option<U256> {
    let bytes: [u8; 32] = hex::decode(hex_target).ok()?.try_into().ok()?;
    Some(U256::from_be_bytes(bytes))
}
