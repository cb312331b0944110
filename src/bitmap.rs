//! Compressed sorted sets of 32-bit entity ids.
//!
//! `IdSet` wraps a Roaring bitmap and is the currency of the whole index
//! layer: every (field, value) entry in a chunk is an `IdSet`, and compound
//! predicates combine by AND/OR/AND-NOT here before ids are resolved back
//! to UUIDs at the very end of a query.
//!
//! The serialized form is the portable Roaring format wrapped in base64 so
//! it can embed as a JSON string inside chunk records. A bitmap written by
//! one build is readable by the next.

use roaring::RoaringBitmap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Compressed set of u32 entity ids with fast Boolean combination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdSet {
    inner: RoaringBitmap,
}

impl IdSet {
    pub fn new() -> Self {
        Self {
            inner: RoaringBitmap::new(),
        }
    }

    /// Insert an id. Returns true if it was not already present.
    pub fn add(&mut self, id: u32) -> bool {
        self.inner.insert(id)
    }

    /// Remove an id. Returns true if it was present.
    pub fn remove(&mut self, id: u32) -> bool {
        self.inner.remove(id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.contains(id)
    }

    pub fn cardinality(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.inner.iter()
    }

    pub fn min(&self) -> Option<u32> {
        self.inner.min()
    }

    /// Intersection. Roaring runs this container-wise, proportional to the
    /// smaller input, with SIMD paths on supported targets.
    pub fn and(&self, other: &Self) -> Self {
        Self {
            inner: &self.inner & &other.inner,
        }
    }

    pub fn or(&self, other: &Self) -> Self {
        Self {
            inner: &self.inner | &other.inner,
        }
    }

    /// Union of many sets. Folds largest-first so the accumulator allocates
    /// its containers once.
    pub fn or_many<'a>(sets: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut sets: Vec<&Self> = sets.into_iter().collect();
        sets.sort_by_key(|s| std::cmp::Reverse(s.cardinality()));
        let mut acc = RoaringBitmap::new();
        for s in sets {
            acc |= &s.inner;
        }
        Self { inner: acc }
    }

    /// Set difference: ids in `self` but not in `other`.
    pub fn and_not(&self, other: &Self) -> Self {
        Self {
            inner: &self.inner - &other.inner,
        }
    }

    pub fn union_with(&mut self, other: &Self) {
        self.inner |= &other.inner;
    }

    /// Portable Roaring bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.inner.serialized_size());
        // Writing to a Vec cannot fail.
        self.inner
            .serialize_into(&mut buf)
            .expect("serialize into Vec");
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, std::io::Error> {
        Ok(Self {
            inner: RoaringBitmap::deserialize_from(bytes)?,
        })
    }

    pub fn from_iter(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            inner: ids.into_iter().collect(),
        }
    }
}

impl Serialize for IdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.to_bytes());
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for IdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::Engine as _;
        let encoded = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Self::from_bytes(&bytes).map_err(D::Error::custom)
    }
}
