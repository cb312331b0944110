//! Per-field sparse index: the routing directory over a field's chunks.
//!
//! The sparse index is the only structure loaded to plan a lookup; chunks
//! load on demand. Each descriptor carries a copy of its chunk's zone map,
//! Bloom filter, and cardinality counters, so point probes prune on
//! zone-range ∧ Bloom and range probes prune on interval overlap without
//! touching chunk objects at all.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bloom::BloomFilter;
use super::chunk::{Chunk, ZoneMap};
use super::normalize::IndexKey;

/// Routing summary of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_id: u32,
    pub zone: ZoneMap,
    /// Distinct values in the chunk.
    pub entry_count: u64,
    pub bloom: BloomFilter,
}

impl ChunkDescriptor {
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            zone: chunk.zone.clone(),
            entry_count: chunk.distinct_values() as u64,
            bloom: chunk.bloom.clone(),
        }
    }
}

/// Directory of chunk descriptors for one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseIndex {
    pub field: String,
    pub chunks: BTreeMap<u32, ChunkDescriptor>,
    pub next_chunk_id: u32,
}

impl SparseIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            chunks: BTreeMap::new(),
            next_chunk_id: 0,
        }
    }

    /// Hand out the next chunk id. Monotone; never reused, so a crash
    /// between a split and this index's write cannot collide (the seed is
    /// also persisted inside every chunk).
    pub fn allocate_chunk_id(&mut self) -> u32 {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        id
    }

    /// Refresh (or insert) the descriptor for a chunk after mutation.
    pub fn upsert_descriptor(&mut self, chunk: &Chunk) {
        self.chunks
            .insert(chunk.chunk_id, ChunkDescriptor::of(chunk));
    }

    pub fn remove_descriptor(&mut self, chunk_id: u32) {
        self.chunks.remove(&chunk_id);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Candidate chunks for a point probe: zone covers the key and the
    /// Bloom filter admits it.
    pub fn find_chunks_for_value(&self, key: &IndexKey) -> Vec<u32> {
        let probe = key.storage_key();
        self.chunks
            .values()
            .filter(|d| d.zone.covers(key) && d.bloom.contains(probe.as_bytes()))
            .map(|d| d.chunk_id)
            .collect()
    }

    /// Candidate chunks for a range probe: zone interval overlaps
    /// `[lo, hi]` under the given inclusivity. `None` bounds are open.
    pub fn find_chunks_for_range(
        &self,
        lo: Option<&IndexKey>,
        lo_inclusive: bool,
        hi: Option<&IndexKey>,
        hi_inclusive: bool,
    ) -> Vec<u32> {
        self.chunks
            .values()
            .filter(|d| d.zone.overlaps(lo, lo_inclusive, hi, hi_inclusive))
            .map(|d| d.chunk_id)
            .collect()
    }

    pub fn all_chunk_ids(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }

    /// Chunk to insert a new key into: the chunk whose zone covers the
    /// key, else the nearest chunk by range, else none (caller creates the
    /// field's first chunk).
    pub fn route_for_insert(&self, key: &IndexKey) -> Option<u32> {
        if self.chunks.is_empty() {
            return None;
        }
        for d in self.chunks.values() {
            if d.zone.covers(key) {
                return Some(d.chunk_id);
            }
        }
        // Outside every range: extend the chunk whose boundary is closest
        // in value order - the one with the greatest max below the key, or
        // failing that the smallest min above it.
        let below = self
            .chunks
            .values()
            .filter(|d| d.zone.max.as_ref().is_some_and(|max| max < key))
            .max_by(|a, b| a.zone.max.cmp(&b.zone.max));
        if let Some(d) = below {
            return Some(d.chunk_id);
        }
        self.chunks
            .values()
            .filter(|d| d.zone.min.as_ref().is_some_and(|min| min > key))
            .min_by(|a, b| a.zone.min.cmp(&b.zone.min))
            .map(|d| d.chunk_id)
    }

    /// The range-adjacent neighbor of `chunk_id` best suited for a merge:
    /// the neighbor (by min-key order) with the fewest distinct values.
    pub fn merge_partner(&self, chunk_id: u32) -> Option<u32> {
        let mut ordered: Vec<&ChunkDescriptor> = self.chunks.values().collect();
        ordered.sort_by(|a, b| a.zone.min.cmp(&b.zone.min));
        let pos = ordered.iter().position(|d| d.chunk_id == chunk_id)?;
        let prev = pos.checked_sub(1).map(|i| ordered[i]);
        let next = ordered.get(pos + 1).copied();
        match (prev, next) {
            (Some(a), Some(b)) => {
                if a.entry_count <= b.entry_count {
                    Some(a.chunk_id)
                } else {
                    Some(b.chunk_id)
                }
            }
            (Some(a), None) => Some(a.chunk_id),
            (None, Some(b)) => Some(b.chunk_id),
            (None, None) => None,
        }
    }

    /// Total distinct values across all chunks. Planner selectivity input.
    pub fn total_entry_count(&self) -> u64 {
        self.chunks.values().map(|d| d.entry_count).sum()
    }

    /// Total postings across all chunks.
    pub fn total_posting_count(&self) -> u64 {
        self.chunks.values().map(|d| d.zone.count).sum()
    }

    /// Approximate in-memory size, for weighted cache accounting.
    pub fn size_bytes(&self) -> usize {
        let descriptors: usize = self
            .chunks
            .values()
            .map(|d| d.bloom.size_bytes() + 96)
            .sum();
        descriptors + self.field.len() + 48
    }
}
