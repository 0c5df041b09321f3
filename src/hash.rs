//! Deterministic FNV-1a hashing.
//!
//! Both peers must agree on every hash they exchange, so nothing here is seeded. The same
//! function also checksums datagrams on the wire.
//!
//! ```
//! use netplay_rollback::hash::{fnv1a_bytes, fnv1a_hash, DeterministicHasher};
//! use std::hash::Hasher;
//!
//! let mut hasher = DeterministicHasher::new();
//! hasher.write(b"netplay");
//! assert_eq!(hasher.finish(), fnv1a_bytes(b"netplay"));
//! assert_eq!(fnv1a_hash(&7u32), fnv1a_hash(&7u32));
//! ```
//!
//! FNV-1a is not cryptographically secure. It only has to catch accidental divergence and
//! line noise.

use std::hash::{Hash, Hasher};

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// A [`Hasher`] implementing 64-bit FNV-1a.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a hasher at the FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Hashes a byte slice directly, without any `Hash` length prefix.
#[inline]
#[must_use]
pub fn fnv1a_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

/// Hashes any [`Hash`] value deterministically.
#[inline]
pub fn fnv1a_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DeterministicHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_config::miri_case_count;
    use proptest::prelude::*;

    #[test]
    fn empty_input_is_offset_basis() {
        assert_eq!(fnv1a_bytes(&[]), FNV_OFFSET_BASIS);
    }

    #[test]
    fn known_vectors() {
        // Reference values for 64-bit FNV-1a.
        assert_eq!(fnv1a_bytes(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_bytes(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn single_bit_flip_changes_hash() {
        let original = b"PlayerInputs".to_vec();
        let mut flipped = original.clone();
        flipped[3] ^= 0x01;
        assert_ne!(fnv1a_bytes(&original), fnv1a_bytes(&flipped));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        #[test]
        fn split_writes_match_single_write(bytes in proptest::collection::vec(any::<u8>(), 0..64), cut in 0usize..64) {
            let cut = cut.min(bytes.len());
            let mut hasher = DeterministicHasher::new();
            hasher.write(&bytes[..cut]);
            hasher.write(&bytes[cut..]);
            prop_assert_eq!(hasher.finish(), fnv1a_bytes(&bytes));
        }
    }
}
