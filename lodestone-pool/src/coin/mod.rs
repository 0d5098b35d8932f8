//! Coin-specific hashing and job construction.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

use sha2::{Digest, Sha256};

pub mod bitcoin;
pub mod merkle;
pub mod target;

/// Total bytes reserved for extranonce data in the coinbase script.
pub const EXTRANONCE_PLACEHOLDER_LENGTH: usize = 8;

/// Bytes of the placeholder assigned by the pool per connection.
pub const EXTRANONCE1_BYTES: usize = 4;

/// Bytes the miner iterates itself.
pub const EXTRANONCE2_BYTES: usize = EXTRANONCE_PLACEHOLDER_LENGTH - EXTRANONCE1_BYTES;

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Hands out unique extranonce1 values.
///
/// The top five bits carry an instance id drawn from OS randomness at
/// startup, so pool instances restarted back to back (or running behind
/// the same port in a cluster) do not replay each other's extranonce
/// space. The remaining bits count up and wrap.
#[derive(Debug)]
pub struct ExtraNonceProvider {
    counter: AtomicU32,
    instance_id: u32,
}

const ID_BITS: u32 = 5;
const ID_SHIFT: u32 = (EXTRANONCE1_BYTES as u32) * 8 - ID_BITS;
const NONCE_MAX: u32 = (1 << ID_SHIFT) - 1;

impl ExtraNonceProvider {
    pub fn new() -> Self {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u64(0);
        let instance_id = (hasher.finish() as u32) & ((1 << ID_BITS) - 1);
        Self {
            counter: AtomicU32::new(0),
            instance_id,
        }
    }

    /// Next extranonce1 as lowercase hex, always `EXTRANONCE1_BYTES` wide.
    pub fn next(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) & NONCE_MAX;
        let value = (self.instance_id << ID_SHIFT) | counter;
        format!("{value:08x}")
    }
}

impl Default for ExtraNonceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sha256d_known_vector() {
        // sha256d("") starts with 5df6e0e2, a fixture from the reference
        // client test suite.
        let hash = sha256d(b"");
        assert_eq!(&hash[..4], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn extranonces_are_unique_and_sized() {
        let provider = ExtraNonceProvider::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let value = provider.next();
            assert_eq!(value.len(), EXTRANONCE1_BYTES * 2);
            assert!(seen.insert(value));
        }
    }

    #[test]
    fn instance_id_occupies_top_bits() {
        let provider = ExtraNonceProvider::new();
        let first = u32::from_str_radix(&provider.next(), 16).unwrap();
        let second = u32::from_str_radix(&provider.next(), 16).unwrap();
        assert_eq!(first >> ID_SHIFT, second >> ID_SHIFT);
        assert_eq!(second & NONCE_MAX, (first & NONCE_MAX) + 1);
    }
}
