//! Bloom filter for retention checks
//!
//! Wire format matches what the satellite ships: the first byte is the
//! hash-function count, the rest is the bitmap. Hashing is derived from the
//! key bytes directly so filters built on one machine answer identically on
//! another.

use crate::types::Key;
use crate::{Error, Result};

/// Bloom filter over 32-byte keys.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a filter sized for `expected` keys at the given false
    /// positive rate.
    pub fn optimal(expected: usize, fp_rate: f64) -> Self {
        let expected = expected.max(1);
        let fp_rate = fp_rate.clamp(1e-9, 0.5);
        // m = -n * ln(p) / (ln 2)^2, k = (m/n) * ln 2
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(expected as f64) * fp_rate.ln() / (ln2 * ln2)).ceil() as usize;
        let num_bits = num_bits.max(8);
        let num_hashes = ((num_bits as f64 / expected as f64) * ln2).round() as usize;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits: num_bits.div_ceil(8) * 8,
            num_hashes,
        }
    }

    /// Decode a filter from its wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::InvalidArgument(
                "bloom filter too short".to_string(),
            ));
        }
        let num_hashes = data[0] as usize;
        if num_hashes == 0 || num_hashes > 30 {
            return Err(Error::InvalidArgument(format!(
                "bloom filter hash count out of range: {num_hashes}"
            )));
        }
        let bits = data[1..].to_vec();
        Ok(Self {
            num_bits: bits.len() * 8,
            bits,
            num_hashes,
        })
    }

    /// Encode into the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.bits.len());
        out.push(self.num_hashes as u8);
        out.extend_from_slice(&self.bits);
        out
    }

    /// Add a key to the filter.
    pub fn add(&mut self, key: &Key) {
        let (h1, h2) = hash_lanes(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Check if a key may be in the set.
    pub fn may_contain(&self, key: &Key) -> bool {
        let (h1, h2) = hash_lanes(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            if self.bits[bit / 8] >> (bit % 8) & 1 == 0 {
                return false;
            }
        }
        true
    }

    /// Number of hash functions.
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }
}

/// Two independent 64-bit lanes from a uniformly distributed key.
fn hash_lanes(key: &Key) -> (u64, u64) {
    let h1 = u64::from_be_bytes(key[0..8].try_into().unwrap());
    let h2 = u64::from_be_bytes(key[8..16].try_into().unwrap()) | 1;
    (h1, h2)
}
