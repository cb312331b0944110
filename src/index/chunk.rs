//! Index chunks: bounded containers of (value → bitmap) entries.
//!
//! Each chunk belongs to one field and holds a contiguous-by-value slice of
//! that field's posting lists, summarized by a zone map (min/max/count/
//! has_nulls) and a Bloom filter. Chunks split when they outgrow
//! [`SPLIT_THRESHOLD`] distinct values and become merge candidates below
//! [`MERGE_THRESHOLD`]. A chunk is never truncated in place.
//!
//! The on-disk form embeds the field's `next_chunk_id` seed: a crash
//! between a split and the sparse-index write cannot hand out a duplicate
//! chunk id on restart, because the id allocator recovers from the highest
//! seed seen in any chunk.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bloom::BloomFilter;
use super::normalize::IndexKey;
use crate::bitmap::IdSet;

/// Split a chunk before flush once it holds more distinct values than this.
pub const SPLIT_THRESHOLD: usize = 80;

/// A chunk below this many distinct values is eligible to merge with an
/// adjacent chunk on the same field.
pub const MERGE_THRESHOLD: usize = 20;

/// Bloom sizing: capacity is double the split threshold so a chunk at the
/// point of splitting still sits below the 1% design FPR.
const BLOOM_CAPACITY: usize = SPLIT_THRESHOLD * 2;
const BLOOM_FPR: f64 = 0.01;

/// Per-chunk `{min, max, count, has_nulls}` summary used for range pruning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneMap {
    pub min: Option<IndexKey>,
    pub max: Option<IndexKey>,
    /// Total postings: `sum(entries[v].cardinality)`.
    pub count: u64,
    pub has_nulls: bool,
}

impl ZoneMap {
    /// Whether `key` falls inside `[min, max]`.
    pub fn covers(&self, key: &IndexKey) -> bool {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) => min <= key && key <= max,
            _ => false,
        }
    }

    /// Whether `[min, max]` overlaps the query interval.
    pub fn overlaps(
        &self,
        lo: Option<&IndexKey>,
        lo_inclusive: bool,
        hi: Option<&IndexKey>,
        hi_inclusive: bool,
    ) -> bool {
        let (Some(min), Some(max)) = (&self.min, &self.max) else {
            return false;
        };
        if let Some(lo) = lo {
            if max < lo || (!lo_inclusive && max == lo) {
                return false;
            }
        }
        if let Some(hi) = hi {
            if min > hi || (!hi_inclusive && min == hi) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ChunkRecord", into = "ChunkRecord")]
pub struct Chunk {
    pub chunk_id: u32,
    pub field: String,
    pub entries: BTreeMap<IndexKey, IdSet>,
    pub zone: ZoneMap,
    pub bloom: BloomFilter,
    /// Allocator seed at the time this chunk was last written.
    pub next_chunk_id_seed: u32,
}

impl Chunk {
    pub fn new(chunk_id: u32, field: impl Into<String>, next_chunk_id_seed: u32) -> Self {
        Self {
            chunk_id,
            field: field.into(),
            entries: BTreeMap::new(),
            zone: ZoneMap::default(),
            bloom: BloomFilter::with_capacity(BLOOM_CAPACITY, BLOOM_FPR),
            next_chunk_id_seed,
        }
    }

    pub fn distinct_values(&self) -> usize {
        self.entries.len()
    }

    pub fn needs_split(&self, threshold: usize) -> bool {
        self.entries.len() > threshold
    }

    pub fn mergeable(&self, threshold: usize) -> bool {
        self.entries.len() < threshold
    }

    /// Insert `id` under `key`. Returns false if the posting was already
    /// present.
    pub fn add(&mut self, key: &IndexKey, id: u32) -> bool {
        let entry = self.entries.entry(key.clone()).or_default();
        if !entry.add(id) {
            return false;
        }
        self.zone.count += 1;
        if key.is_null_key() {
            self.zone.has_nulls = true;
        }
        match &self.zone.min {
            Some(min) if min <= key => {}
            _ => self.zone.min = Some(key.clone()),
        }
        match &self.zone.max {
            Some(max) if max >= key => {}
            _ => self.zone.max = Some(key.clone()),
        }
        self.bloom.insert(key.storage_key().as_bytes());
        true
    }

    /// Remove the posting. A value whose bitmap becomes empty is dropped;
    /// the zone map is recomputed when the removal touched its bounds. The
    /// Bloom filter keeps the stale bit (no false negatives either way).
    pub fn remove(&mut self, key: &IndexKey, id: u32) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if !entry.remove(id) {
            return false;
        }
        self.zone.count = self.zone.count.saturating_sub(1);
        let emptied = entry.is_empty();
        if emptied {
            self.entries.remove(key);
            let was_bound = self.zone.min.as_ref() == Some(key)
                || self.zone.max.as_ref() == Some(key)
                || key.is_null_key();
            if was_bound {
                self.recompute_zone_map();
            }
        }
        true
    }

    /// Recompute `{min, max, count, has_nulls}` from entries in one pass.
    pub fn recompute_zone_map(&mut self) {
        let mut zone = ZoneMap::default();
        for (key, ids) in &self.entries {
            zone.count += ids.cardinality();
            if key.is_null_key() {
                zone.has_nulls = true;
            }
        }
        zone.min = self.entries.keys().next().cloned();
        zone.max = self.entries.keys().next_back().cloned();
        self.zone = zone;
    }

    /// Rebuild the Bloom filter from scratch, clearing stale bits left by
    /// removals.
    pub fn rebuild_bloom(&mut self) {
        self.bloom = BloomFilter::with_capacity(BLOOM_CAPACITY, BLOOM_FPR);
        for key in self.entries.keys() {
            self.bloom.insert(key.storage_key().as_bytes());
        }
    }

    /// Partition entries into two approximately equal halves by value
    /// order. `self` keeps the lower half; the upper half moves into a new
    /// chunk with id `new_chunk_id`. Both sides get fresh zone maps and
    /// Bloom filters.
    pub fn split(&mut self, new_chunk_id: u32, next_seed: u32) -> Chunk {
        let mid = self.entries.len() / 2;
        let Some(split_key) = self.entries.keys().nth(mid).cloned() else {
            return Chunk::new(new_chunk_id, self.field.clone(), next_seed);
        };
        let upper = self.entries.split_off(&split_key);

        let mut high = Chunk::new(new_chunk_id, self.field.clone(), next_seed);
        high.entries = upper;
        high.recompute_zone_map();
        high.rebuild_bloom();

        self.next_chunk_id_seed = next_seed;
        self.recompute_zone_map();
        self.rebuild_bloom();
        high
    }

    /// Fold `other`'s entries into `self`. Caller guarantees the two
    /// chunks are range-adjacent on the same field; colliding keys union
    /// their bitmaps.
    pub fn merge_from(&mut self, other: Chunk) {
        debug_assert_eq!(self.field, other.field);
        for (key, ids) in other.entries {
            match self.entries.get_mut(&key) {
                Some(existing) => existing.union_with(&ids),
                None => {
                    self.entries.insert(key, ids);
                }
            }
        }
        self.next_chunk_id_seed = self.next_chunk_id_seed.max(other.next_chunk_id_seed);
        self.recompute_zone_map();
        self.rebuild_bloom();
    }

    /// Approximate in-memory size, for weighted cache accounting.
    pub fn size_bytes(&self) -> usize {
        let entries: usize = self
            .entries
            .iter()
            .map(|(k, v)| k.size_bytes() + v.to_bytes().len() + 16)
            .sum();
        entries + self.bloom.size_bytes() + self.field.len() + 64
    }
}

/// Wire form: JSON object keys must be strings, so entries serialize as a
/// pair list.
#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    chunk_id: u32,
    field: String,
    entries: Vec<(IndexKey, IdSet)>,
    zone: ZoneMap,
    bloom: BloomFilter,
    next_chunk_id: u32,
}

impl From<ChunkRecord> for Chunk {
    fn from(record: ChunkRecord) -> Self {
        Self {
            chunk_id: record.chunk_id,
            field: record.field,
            entries: record.entries.into_iter().collect(),
            zone: record.zone,
            bloom: record.bloom,
            next_chunk_id_seed: record.next_chunk_id,
        }
    }
}

impl From<Chunk> for ChunkRecord {
    fn from(chunk: Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            field: chunk.field,
            entries: chunk.entries.into_iter().collect(),
            zone: chunk.zone,
            bloom: chunk.bloom,
            next_chunk_id: chunk.next_chunk_id_seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(n: f64) -> IndexKey {
        IndexKey::Num(n)
    }

    #[test]
    fn test_add_updates_zone_and_bloom() {
        let mut chunk = Chunk::new(0, "score", 1);
        assert!(chunk.add(&key(5.0), 10));
        assert!(chunk.add(&key(1.0), 11));
        assert!(chunk.add(&key(9.0), 12));
        assert!(!chunk.add(&key(9.0), 12), "duplicate posting rejected");

        assert_eq!(chunk.zone.min, Some(key(1.0)));
        assert_eq!(chunk.zone.max, Some(key(9.0)));
        assert_eq!(chunk.zone.count, 3);
        assert!(chunk.bloom.contains(key(5.0).storage_key().as_bytes()));
    }

    #[test]
    fn test_remove_drops_empty_entry_and_shrinks_zone() {
        let mut chunk = Chunk::new(0, "score", 1);
        chunk.add(&key(1.0), 1);
        chunk.add(&key(9.0), 2);
        assert!(chunk.remove(&key(9.0), 2));
        assert_eq!(chunk.distinct_values(), 1);
        assert_eq!(chunk.zone.max, Some(key(1.0)));
        assert_eq!(chunk.zone.count, 1);
        assert!(!chunk.remove(&key(9.0), 2), "double remove is a no-op");
    }

    #[test]
    fn test_null_key_sets_has_nulls() {
        let mut chunk = Chunk::new(0, "maybe", 1);
        chunk.add(&IndexKey::Str(super::super::normalize::NULL_KEY.into()), 1);
        assert!(chunk.zone.has_nulls);
    }

    #[test]
    fn test_count_conservation_invariant() {
        let mut chunk = Chunk::new(0, "f", 1);
        for i in 0..50u32 {
            chunk.add(&key(f64::from(i % 7)), i);
        }
        let postings: u64 = chunk.entries.values().map(|b| b.cardinality()).sum();
        assert_eq!(postings, chunk.zone.count);
    }

    #[test]
    fn test_split_conserves_entries_disjointly() {
        let mut low = Chunk::new(0, "f", 1);
        for i in 0..100u32 {
            low.add(&key(f64::from(i)), i);
        }
        let high = low.split(1, 2);

        assert!(low.zone.max < high.zone.min, "halves are range-disjoint");
        assert_eq!(low.distinct_values() + high.distinct_values(), 100);
        // Every original posting lands in exactly one half
        for i in 0..100u32 {
            let k = key(f64::from(i));
            let in_low = low.entries.get(&k).map(|b| b.contains(i)).unwrap_or(false);
            let in_high = high.entries.get(&k).map(|b| b.contains(i)).unwrap_or(false);
            assert!(in_low ^ in_high, "posting {i} must be in exactly one half");
        }
        assert_eq!(low.next_chunk_id_seed, 2);
        assert_eq!(high.next_chunk_id_seed, 2);
    }

    #[test]
    fn test_merge_is_split_inverse() {
        let mut low = Chunk::new(0, "f", 1);
        for i in 0..60u32 {
            low.add(&key(f64::from(i)), i);
        }
        let original = low.clone();
        let high = low.split(1, 2);
        low.merge_from(high);

        assert_eq!(low.entries, original.entries);
        assert_eq!(low.zone.count, original.zone.count);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut chunk = Chunk::new(3, "tags", 7);
        chunk.add(&IndexKey::Str("alpha".into()), 1);
        chunk.add(&IndexKey::Str("beta".into()), 2);
        chunk.add(&key(42.0), 3);

        let json = serde_json::to_vec(&chunk).unwrap();
        let back: Chunk = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.chunk_id, 3);
        assert_eq!(back.next_chunk_id_seed, 7);
        assert_eq!(back.entries, chunk.entries);
        assert_eq!(back.zone, chunk.zone);
        assert!(back.bloom.contains(IndexKey::Str("alpha".into()).storage_key().as_bytes()));
    }

    #[test]
    fn test_zone_overlap_inclusivity() {
        let mut chunk = Chunk::new(0, "f", 1);
        chunk.add(&key(10.0), 1);
        chunk.add(&key(20.0), 2);

        assert!(chunk.zone.overlaps(Some(&key(20.0)), true, None, true));
        assert!(!chunk.zone.overlaps(Some(&key(20.0)), false, None, true));
        assert!(chunk.zone.overlaps(None, true, Some(&key(10.0)), true));
        assert!(!chunk.zone.overlaps(None, true, Some(&key(10.0)), false));
        assert!(!chunk.zone.overlaps(Some(&key(21.0)), true, None, true));
    }

    proptest! {
        // entries(c) == entries(c1) ∪ entries(c2), disjoint partition
        #[test]
        fn prop_split_conservation(values in prop::collection::btree_set(0u32..1000, 2..200)) {
            let mut chunk = Chunk::new(0, "f", 1);
            for &v in &values {
                chunk.add(&key(f64::from(v)), v);
            }
            let before = chunk.entries.clone();
            let high = chunk.split(1, 2);

            for (k, ids) in &before {
                let low_has = chunk.entries.contains_key(k);
                let high_has = high.entries.contains_key(k);
                prop_assert!(low_has ^ high_has);
                let found = if low_has { &chunk.entries[k] } else { &high.entries[k] };
                prop_assert_eq!(found, ids);
            }
            prop_assert_eq!(chunk.entries.len() + high.entries.len(), before.len());
        }
    }
}
