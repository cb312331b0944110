//! Per-chunk Bloom filters.
//!
//! A chunk's filter answers "might this value be in the chunk" with zero
//! false negatives, letting the sparse index skip chunks whose zone map
//! overlaps a probe value that the chunk does not actually contain. Sized
//! for ≤1% false positives at chunk capacity.
//!
//! Hashing is FNV-1a double hashing (`h_i = h1 + i·h2 mod m`). FNV is
//! hand-rolled because the bit positions are part of the persisted chunk
//! format; they must not drift with a hasher crate's internals.

use serde::{Deserialize, Serialize};
use serde::de::Error as _;
use serde::{Deserializer, Serializer};

const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// FNV-1a 64-bit.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV64_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV64_PRIME);
    }
    hash
}

/// FNV-1a 32-bit. Word tokens persist this folded to i32.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// Fixed-width Bloom filter over value keys.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size for `capacity` distinct values at `fpr` false-positive rate.
    pub fn with_capacity(capacity: usize, fpr: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-capacity * fpr.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        // Round up to whole bytes
        let num_bits = num_bits.div_ceil(8) * 8;
        let num_hashes = (((num_bits as f64) / capacity) * ln2).round().max(1.0) as u32;
        Self {
            bits: vec![0u8; (num_bits / 8) as usize],
            num_bits,
            num_hashes,
        }
    }

    fn positions(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = fnv1a_64(key);
        // Second hash from the same primitive over the reversed bytes,
        // decorrelated enough for double hashing.
        let rev: Vec<u8> = key.iter().rev().copied().collect();
        let h2 = fnv1a_64(&rev) | 1; // odd, so it cycles the whole table
        let m = self.num_bits;
        (0..u64::from(self.num_hashes)).map(move |i| {
            h1.wrapping_add(i.wrapping_mul(h2)) % m
        })
    }

    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<u64> = self.positions(key).collect();
        for pos in positions {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    /// Probabilistic membership: false positives possible, false negatives
    /// never.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.positions(key)
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.len()
    }
}

#[derive(Serialize, Deserialize)]
struct BloomRecord {
    bits: String,
    num_bits: u64,
    num_hashes: u32,
}

impl Serialize for BloomFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        BloomRecord {
            bits: base64::engine::general_purpose::STANDARD.encode(&self.bits),
            num_bits: self.num_bits,
            num_hashes: self.num_hashes,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BloomFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::Engine as _;
        let record = BloomRecord::deserialize(deserializer)?;
        let bits = base64::engine::general_purpose::STANDARD
            .decode(record.bits.as_bytes())
            .map_err(D::Error::custom)?;
        if bits.len() as u64 * 8 != record.num_bits {
            return Err(D::Error::custom("bloom bit length mismatch"));
        }
        Ok(Self {
            bits,
            num_bits: record.num_bits,
            num_hashes: record.num_hashes,
        })
    }
}
