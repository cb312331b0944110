//! Metadata indexing subsystem.
//!
//! An inverted index from (field, value) to entity ids, physically
//! organized as adaptively chunked sparse indices with zone maps and Bloom
//! filters, over compressed bitmaps in the interned integer-id space.
//!
//! ## Module structure
//!
//! - `normalize` - value normalization, temporal bucketing, field extraction
//! - `bloom` - per-chunk Bloom filters and the FNV primitives
//! - `chunk` - chunk objects: entries, zone maps, split/merge
//! - `sparse` - per-field routing directories
//! - `predicate` - canonical predicate AST and the alias-tolerant parser
//! - `planner` - conjunct ordering and bitmap combination
//!
//! The write path extracts (field, key) pairs from entity metadata, interns
//! the entity UUID to a dense integer, and adds the posting to the routed
//! chunk, splitting on overflow. The read path routes each predicate leaf
//! through the sparse index (zone maps ∧ Bloom filters), loads candidate
//! chunks on demand, and combines postings with bitmap AND/OR/AND-NOT,
//! converting back to UUIDs exactly once at the end.

pub mod bloom;
pub mod chunk;
pub mod normalize;
pub mod planner;
pub mod predicate;
pub mod sparse;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::bitmap::IdSet;
use crate::cache::{CachedValue, UnifiedCache};
use crate::interner::{IdMapper, InternerError};
use crate::model::Metadata;
use crate::storage::{keys, BatchDeleteOptions, ObjectStore, StorageError};
use crate::writebuf::WriteBuffer;

use chunk::Chunk;
use normalize::{
    extract_fields, normalize_value, IndexKey, NormalizeOptions, Normalized, ALL_FIELD,
    PRESENT_KEY,
};
use predicate::{CompareOp, Predicate, PredicateError, TextOp};
use sparse::SparseIndex;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid predicate: {0}")]
    InvalidPredicate(#[from] PredicateError),
    #[error("invalid pattern in matches predicate: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("index record corrupted at {path}: {reason}")]
    Corrupted { path: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Interner(#[from] InternerError),
}

/// Source of exact (un-normalized) metadata values, used to refine
/// boundary buckets of temporal range queries and to sort temporal fields
/// at full precision. The entity store implements this.
#[async_trait]
pub trait ExactValueSource: Send + Sync {
    async fn exact_values(
        &self,
        ids: &[Uuid],
        field: &str,
    ) -> Result<HashMap<Uuid, Value>, StorageError>;
}

/// Exact-value source with no data; boundary refinement drops candidates.
/// Test and rebuild plumbing only.
pub struct NoExactValues;

#[async_trait]
impl ExactValueSource for NoExactValues {
    async fn exact_values(
        &self,
        _ids: &[Uuid],
        _field: &str,
    ) -> Result<HashMap<Uuid, Value>, StorageError> {
        Ok(HashMap::new())
    }
}

/// Index tuning. Defaults mirror the design constants; tests shrink them.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub split_threshold: usize,
    pub merge_threshold: usize,
    /// Distinct values per field after which numeric keys round to two
    /// decimals. Detection is statistics-driven, never field-name-driven.
    pub high_cardinality_threshold: u64,
    /// avg index entries per entity above which the index is considered
    /// corrupt (expected ≈ 30).
    pub corruption_avg_threshold: f64,
    /// Fields preloaded at startup, by occurrence statistics.
    pub warm_fields: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            split_threshold: chunk::SPLIT_THRESHOLD,
            merge_threshold: chunk::MERGE_THRESHOLD,
            high_cardinality_threshold: 10_000,
            corruption_avg_threshold: 100.0,
            warm_fields: 8,
        }
    }
}

/// Type-field affinity statistics: occurrence counts per (entity type,
/// field) pair, plus aggregate entry and entity counts. Drives conjunct
/// ordering, cache warm-up, and the health check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub entity_count: u64,
    pub total_index_entries: u64,
    pub type_field_counts: BTreeMap<String, BTreeMap<String, u64>>,
    pub type_totals: BTreeMap<String, u64>,
}

impl IndexStats {
    pub fn avg_entries_per_entity(&self) -> f64 {
        if self.entity_count == 0 {
            0.0
        } else {
            self.total_index_entries as f64 / self.entity_count as f64
        }
    }

    fn record_entity(&mut self, type_name: &str, fields: &BTreeSet<String>, entries: usize) {
        self.entity_count += 1;
        self.total_index_entries += entries as u64;
        *self.type_totals.entry(type_name.to_string()).or_insert(0) += 1;
        let per_type = self
            .type_field_counts
            .entry(type_name.to_string())
            .or_default();
        for field in fields {
            *per_type.entry(field.clone()).or_insert(0) += 1;
        }
    }

    fn unrecord_entity(&mut self, type_name: &str, fields: &BTreeSet<String>, entries: usize) {
        self.entity_count = self.entity_count.saturating_sub(1);
        self.total_index_entries = self.total_index_entries.saturating_sub(entries as u64);
        if let Some(total) = self.type_totals.get_mut(type_name) {
            *total = total.saturating_sub(1);
        }
        if let Some(per_type) = self.type_field_counts.get_mut(type_name) {
            for field in fields {
                if let Some(count) = per_type.get_mut(field) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Fields ordered by total occurrence, hottest first.
    pub fn top_fields(&self, n: usize) -> Vec<String> {
        let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
        for per_type in self.type_field_counts.values() {
            for (field, count) in per_type {
                *totals.entry(field.as_str()).or_insert(0) += count;
            }
        }
        let mut ordered: Vec<(&str, u64)> = totals.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ordered.into_iter().take(n).map(|(f, _)| f.to_string()).collect()
    }
}

/// Health check outcome.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub entity_count: u64,
    pub total_index_entries: u64,
    pub avg_entries_per_entity: f64,
    /// Entry leak detected; the caller should trigger a rebuild.
    pub corrupt: bool,
}

/// In-memory state of one field's index: the routing directory plus a
/// dirty-chunk overlay. Clean chunks live in the unified cache.
struct FieldState {
    sparse: SparseIndex,
    loaded: HashMap<u32, Chunk>,
    dirty: BTreeSet<u32>,
    deleted: BTreeSet<u32>,
    /// value→count directory persisted as `__metadata_field_index__field_*`.
    value_counts: BTreeMap<String, u64>,
    sparse_dirty: bool,
}

impl FieldState {
    fn fresh(field: &str) -> Self {
        Self {
            sparse: SparseIndex::new(field),
            loaded: HashMap::new(),
            dirty: BTreeSet::new(),
            deleted: BTreeSet::new(),
            value_counts: BTreeMap::new(),
            sparse_dirty: false,
        }
    }
}

/// Yield to the executor after this many inner-loop iterations.
const YIELD_EVERY: usize = 64;

/// Result of a single posting removal.
#[derive(Default)]
struct RemoveOutcome {
    removed: bool,
    /// Chunk that dropped below the merge threshold, if any.
    merge_candidate: Option<u32>,
}

/// Public predicate-query API over the chunked inverted index.
pub struct MetadataIndex {
    store: Arc<dyn ObjectStore>,
    writer: Arc<WriteBuffer>,
    interner: Arc<Mutex<IdMapper>>,
    cache: Arc<UnifiedCache>,
    fields: RwLock<HashMap<String, Arc<Mutex<FieldState>>>>,
    registry: Mutex<Registry>,
    stats: Mutex<IndexStats>,
    /// Fields whose numeric keys round to two decimals. Crossing the
    /// distinct-value threshold flips a field in; it never flips back.
    high_cardinality: std::sync::Mutex<HashSet<String>>,
    config: IndexConfig,
}

struct Registry {
    fields: BTreeSet<String>,
    dirty: bool,
}

impl MetadataIndex {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        writer: Arc<WriteBuffer>,
        interner: Arc<Mutex<IdMapper>>,
        cache: Arc<UnifiedCache>,
        config: IndexConfig,
    ) -> Self {
        Self {
            store,
            writer,
            interner,
            cache,
            fields: RwLock::new(HashMap::new()),
            registry: Mutex::new(Registry {
                fields: BTreeSet::new(),
                dirty: false,
            }),
            stats: Mutex::new(IndexStats::default()),
            high_cardinality: std::sync::Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Load the field registry and statistics, then warm the cache with
    /// the hottest fields' routing directories.
    pub async fn init(&self) -> Result<(), IndexError> {
        if let Some(bytes) = self.store.get_opt(keys::FIELD_REGISTRY).await? {
            let fields: BTreeSet<String> =
                serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupted {
                    path: keys::FIELD_REGISTRY.to_string(),
                    reason: e.to_string(),
                })?;
            self.registry.lock().await.fields = fields;
        }
        if let Some(bytes) = self.store.get_opt(keys::STATISTICS).await? {
            let stats: IndexStats =
                serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupted {
                    path: keys::STATISTICS.to_string(),
                    reason: e.to_string(),
                })?;
            *self.stats.lock().await = stats;
        }

        let warm = {
            let stats = self.stats.lock().await;
            stats.top_fields(self.config.warm_fields)
        };
        for field in &warm {
            let _ = self.field_state(field, false).await?;
        }
        let registered = self.registry.lock().await.fields.len();
        tracing::info!(fields = registered, warmed = warm.len(), "metadata index ready");
        Ok(())
    }

    pub async fn stats(&self) -> IndexStats {
        self.stats.lock().await.clone()
    }

    /// Compute `avg_entries_per_entity` and flag the historical entry-leak
    /// corruption pattern.
    pub async fn health_check(&self) -> HealthReport {
        let stats = self.stats.lock().await;
        let avg = stats.avg_entries_per_entity();
        let corrupt = avg > self.config.corruption_avg_threshold;
        if corrupt {
            tracing::warn!(
                avg_entries_per_entity = avg,
                "index health check failed; rebuild recommended"
            );
        }
        HealthReport {
            entity_count: stats.entity_count,
            total_index_entries: stats.total_index_entries,
            avg_entries_per_entity: avg,
            corrupt,
        }
    }

    // ===== Write path =====

    /// Extract, intern, and add every (field, key) pair of an entity.
    /// Returns the number of index entries written.
    pub async fn add_entity(
        &self,
        id: Uuid,
        type_name: &str,
        metadata: &Metadata,
    ) -> Result<usize, IndexError> {
        let pairs = self.pairs_for(metadata);
        let int_id = self.interner.lock().await.get_or_intern(id);

        let mut fields_touched = BTreeSet::new();
        for (field, key) in &pairs {
            self.apply_add(field, key, int_id).await?;
            fields_touched.insert(field.clone());
        }
        self.stats
            .lock()
            .await
            .record_entity(type_name, &fields_touched, pairs.len());
        tracing::debug!(entity = %id, entries = pairs.len(), "entity indexed");
        Ok(pairs.len())
    }

    /// Symmetric removal using the entity's known metadata.
    pub async fn remove_entity(
        &self,
        id: Uuid,
        type_name: &str,
        metadata: &Metadata,
    ) -> Result<usize, IndexError> {
        let pairs = self.pairs_for(metadata);
        let Some(int_id) = self.interner.lock().await.get(&id) else {
            return Ok(0);
        };

        let mut fields_touched = BTreeSet::new();
        let mut removed = 0usize;
        for (field, key) in &pairs {
            if self.apply_remove(field, key, int_id).await? {
                removed += 1;
            }
            fields_touched.insert(field.clone());
        }
        self.stats
            .lock()
            .await
            .unrecord_entity(type_name, &fields_touched, removed);
        tracing::debug!(entity = %id, entries = removed, "entity unindexed");
        Ok(removed)
    }

    /// Diff-apply a metadata update: postings present only in `old` are
    /// removed, postings present only in `new` are added. Shared postings
    /// are untouched.
    pub async fn update_entity(
        &self,
        id: Uuid,
        type_name: &str,
        old: &Metadata,
        new: &Metadata,
    ) -> Result<(), IndexError> {
        let old_pairs: BTreeSet<(String, IndexKey)> = self.pairs_for(old).into_iter().collect();
        let new_pairs: BTreeSet<(String, IndexKey)> = self.pairs_for(new).into_iter().collect();
        let int_id = self.interner.lock().await.get_or_intern(id);

        let mut removed = 0usize;
        let mut added = 0usize;
        for (field, key) in old_pairs.difference(&new_pairs) {
            if self.apply_remove(field, key, int_id).await? {
                removed += 1;
            }
        }
        for (field, key) in new_pairs.difference(&old_pairs) {
            self.apply_add(field, key, int_id).await?;
            added += 1;
        }

        let mut stats = self.stats.lock().await;
        stats.total_index_entries =
            (stats.total_index_entries + added as u64).saturating_sub(removed as u64);
        drop(stats);
        tracing::debug!(entity = %id, entity_type = type_name, added, removed, "entity reindexed");
        Ok(())
    }

    /// Slow-path removal when the caller has no metadata: scan every chunk
    /// of every field and strip the id wherever it appears.
    pub async fn remove_entity_by_scan(&self, id: Uuid) -> Result<usize, IndexError> {
        let Some(int_id) = self.interner.lock().await.get(&id) else {
            return Ok(0);
        };
        let field_names: Vec<String> = {
            let registry = self.registry.lock().await;
            registry.fields.iter().cloned().collect()
        };

        let mut removed = 0usize;
        for field in field_names {
            let Some(state_arc) = self.field_state(&field, false).await? else {
                continue;
            };
            let mut state = state_arc.lock().await;
            let chunk_ids = state.sparse.all_chunk_ids();
            for (i, chunk_id) in chunk_ids.into_iter().enumerate() {
                self.ensure_loaded(&mut state, &field, chunk_id).await?;
                let chunk = state.loaded.get(&chunk_id).expect("just loaded");
                let hit_keys: Vec<IndexKey> = chunk
                    .entries
                    .iter()
                    .filter(|(_, ids)| ids.contains(int_id))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in hit_keys {
                    let outcome = self.remove_in_state(&mut state, &field, &key, int_id);
                    if outcome.removed {
                        removed += 1;
                    }
                    if let Some(shrunk) = outcome.merge_candidate {
                        self.maybe_merge(&mut state, &field, shrunk).await?;
                    }
                }
                if i % YIELD_EVERY == YIELD_EVERY - 1 {
                    tokio::task::yield_now().await;
                }
            }
        }
        let mut stats = self.stats.lock().await;
        stats.entity_count = stats.entity_count.saturating_sub(1);
        stats.total_index_entries = stats.total_index_entries.saturating_sub(removed as u64);
        drop(stats);
        tracing::debug!(entity = %id, entries = removed, "entity removed by full scan");
        Ok(removed)
    }

    /// Extract pairs plus the synthetic presence posting, applying
    /// two-decimal rounding to fields flagged high-cardinality.
    fn pairs_for(&self, metadata: &Metadata) -> Vec<(String, IndexKey)> {
        let mut pairs = extract_fields(metadata, NormalizeOptions::default());
        let high_card = self.high_cardinality.lock().expect("flag set poisoned");
        if !high_card.is_empty() {
            for (field, key) in &mut pairs {
                if high_card.contains(field.as_str()) {
                    if let IndexKey::Num(n) = key {
                        *key = IndexKey::Num((*n * 100.0).round() / 100.0);
                    }
                }
            }
        }
        drop(high_card);
        pairs.push((
            ALL_FIELD.to_string(),
            IndexKey::Str(PRESENT_KEY.to_string()),
        ));
        pairs
    }

    async fn apply_add(
        &self,
        field: &str,
        key: &IndexKey,
        int_id: u32,
    ) -> Result<(), IndexError> {
        let state_arc = self
            .field_state(field, true)
            .await?
            .expect("create requested");
        let mut state = state_arc.lock().await;

        let chunk_id = match state.sparse.route_for_insert(key) {
            Some(id) => {
                self.ensure_loaded(&mut state, field, id).await?;
                id
            }
            None => {
                let id = state.sparse.allocate_chunk_id();
                let seed = state.sparse.next_chunk_id;
                state.loaded.insert(id, Chunk::new(id, field, seed));
                id
            }
        };

        let chunk = state.loaded.get_mut(&chunk_id).expect("loaded above");
        if !chunk.add(key, int_id) {
            return Ok(());
        }
        state.dirty.insert(chunk_id);
        state.sparse_dirty = true;
        self.cache.remove(&keys::chunk(field, chunk_id));
        *state
            .value_counts
            .entry(key.storage_key())
            .or_insert(0) += 1;

        let needs_split = state
            .loaded
            .get(&chunk_id)
            .expect("loaded")
            .needs_split(self.config.split_threshold);
        if needs_split {
            let new_id = state.sparse.allocate_chunk_id();
            let seed = state.sparse.next_chunk_id;
            let chunk = state.loaded.get_mut(&chunk_id).expect("loaded");
            let high = chunk.split(new_id, seed);
            tracing::debug!(field, low = chunk_id, high = new_id, "chunk split");
            let low_desc = state.loaded.get(&chunk_id).expect("loaded").clone();
            state.sparse.upsert_descriptor(&low_desc);
            state.sparse.upsert_descriptor(&high);
            state.loaded.insert(new_id, high);
            state.dirty.insert(new_id);
        } else {
            let chunk = state.loaded.get(&chunk_id).expect("loaded").clone();
            state.sparse.upsert_descriptor(&chunk);
        }

        // Statistics-driven high-cardinality detection
        if state.sparse.total_entry_count() > self.config.high_cardinality_threshold {
            let mut high_card = self.high_cardinality.lock().expect("flag set poisoned");
            if high_card.insert(field.to_string()) {
                tracing::info!(field, "field flagged high-cardinality; rounding numerics");
            }
        }
        Ok(())
    }

    async fn apply_remove(
        &self,
        field: &str,
        key: &IndexKey,
        int_id: u32,
    ) -> Result<bool, IndexError> {
        let Some(state_arc) = self.field_state(field, false).await? else {
            return Ok(false);
        };
        let mut state = state_arc.lock().await;
        let candidates = state.sparse.find_chunks_for_value(key);
        for chunk_id in candidates {
            self.ensure_loaded(&mut state, field, chunk_id).await?;
        }
        let outcome = self.remove_in_state(&mut state, field, key, int_id);
        if let Some(shrunk) = outcome.merge_candidate {
            self.maybe_merge(&mut state, field, shrunk).await?;
        }
        Ok(outcome.removed)
    }

    /// Remove a posting from whichever loaded chunk holds it, handling
    /// empty-chunk deletion and reporting underflow for the caller to
    /// merge. Caller has loaded all candidate chunks.
    fn remove_in_state(
        &self,
        state: &mut FieldState,
        field: &str,
        key: &IndexKey,
        int_id: u32,
    ) -> RemoveOutcome {
        let candidates: Vec<u32> = state.sparse.find_chunks_for_value(key);
        let mut outcome = RemoveOutcome::default();
        for chunk_id in candidates {
            let Some(chunk) = state.loaded.get_mut(&chunk_id) else {
                continue;
            };
            if !chunk.remove(key, int_id) {
                continue;
            }
            outcome.removed = true;
            state.dirty.insert(chunk_id);
            state.sparse_dirty = true;
            self.cache.remove(&keys::chunk(field, chunk_id));
            if let Some(count) = state.value_counts.get_mut(&key.storage_key()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.value_counts.remove(&key.storage_key());
                }
            }

            let chunk = state.loaded.get(&chunk_id).expect("present");
            if chunk.entries.is_empty() {
                state.sparse.remove_descriptor(chunk_id);
                state.loaded.remove(&chunk_id);
                state.dirty.remove(&chunk_id);
                state.deleted.insert(chunk_id);
            } else {
                if chunk.mergeable(self.config.merge_threshold) {
                    outcome.merge_candidate = Some(chunk_id);
                }
                let snapshot = state.loaded.get(&chunk_id).expect("present").clone();
                state.sparse.upsert_descriptor(&snapshot);
            }
            break;
        }
        outcome
    }

    /// Merge an underflowing chunk into its range-adjacent partner when
    /// the combined size stays below the split threshold. The partner
    /// absorbs; the underflowing chunk is deleted.
    async fn maybe_merge(
        &self,
        state: &mut FieldState,
        field: &str,
        chunk_id: u32,
    ) -> Result<(), IndexError> {
        let Some(partner_id) = state.sparse.merge_partner(chunk_id) else {
            return Ok(());
        };
        let combined = state
            .sparse
            .chunks
            .get(&chunk_id)
            .map(|d| d.entry_count as usize)
            .unwrap_or(0)
            .saturating_add(
                state
                    .sparse
                    .chunks
                    .get(&partner_id)
                    .map(|d| d.entry_count as usize)
                    .unwrap_or(usize::MAX),
            );
        if combined > self.config.split_threshold {
            return Ok(());
        }
        self.ensure_loaded(state, field, partner_id).await?;

        let Some(absorbed) = state.loaded.remove(&chunk_id) else {
            return Ok(());
        };
        let partner = state.loaded.get_mut(&partner_id).expect("loaded above");
        partner.merge_from(absorbed);
        tracing::debug!(field, absorbed = chunk_id, into = partner_id, "chunk merge");

        state.sparse.remove_descriptor(chunk_id);
        let snapshot = state.loaded.get(&partner_id).expect("present").clone();
        state.sparse.upsert_descriptor(&snapshot);
        state.dirty.remove(&chunk_id);
        state.dirty.insert(partner_id);
        state.deleted.insert(chunk_id);
        self.cache.remove(&keys::chunk(field, chunk_id));
        self.cache.remove(&keys::chunk(field, partner_id));
        Ok(())
    }

    // ===== Field and chunk loading =====

    /// Get (optionally creating) the in-memory state for a field. Loads
    /// the sparse index and value-count directory from cache or store on
    /// first touch.
    async fn field_state(
        &self,
        field: &str,
        create: bool,
    ) -> Result<Option<Arc<Mutex<FieldState>>>, IndexError> {
        if let Some(state) = self.fields.read().await.get(field) {
            return Ok(Some(Arc::clone(state)));
        }

        let sparse_key = keys::sparse_index(field);
        let sparse = if let Some(cached) = self.cache.get_sparse(&sparse_key) {
            Some((*cached).clone())
        } else if let Some(bytes) = self.store.get_opt(&sparse_key).await? {
            let parsed: SparseIndex =
                serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupted {
                    path: sparse_key.clone(),
                    reason: e.to_string(),
                })?;
            self.cache.insert(
                sparse_key.clone(),
                CachedValue::Sparse(Arc::new(parsed.clone())),
            );
            Some(parsed)
        } else {
            None
        };

        let state = match sparse {
            Some(sparse) => {
                let counts_key = keys::field_index(field);
                let value_counts = match self.store.get_opt(&counts_key).await? {
                    Some(bytes) => {
                        serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupted {
                            path: counts_key,
                            reason: e.to_string(),
                        })?
                    }
                    None => BTreeMap::new(),
                };
                FieldState {
                    sparse,
                    loaded: HashMap::new(),
                    dirty: BTreeSet::new(),
                    deleted: BTreeSet::new(),
                    value_counts,
                    sparse_dirty: false,
                }
            }
            None if create => {
                let mut registry = self.registry.lock().await;
                if registry.fields.insert(field.to_string()) {
                    registry.dirty = true;
                }
                FieldState::fresh(field)
            }
            None => return Ok(None),
        };

        let mut fields = self.fields.write().await;
        let entry = fields
            .entry(field.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(state)));
        Ok(Some(Arc::clone(entry)))
    }

    /// Bring a chunk into the field's overlay from cache or store.
    async fn ensure_loaded(
        &self,
        state: &mut FieldState,
        field: &str,
        chunk_id: u32,
    ) -> Result<(), IndexError> {
        if state.loaded.contains_key(&chunk_id) {
            return Ok(());
        }
        let chunk_key = keys::chunk(field, chunk_id);
        let chunk = if let Some(cached) = self.cache.get_chunk(&chunk_key) {
            (*cached).clone()
        } else {
            match self.store.get_opt(&chunk_key).await? {
                Some(bytes) => {
                    let parsed: Chunk =
                        serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupted {
                            path: chunk_key.clone(),
                            reason: e.to_string(),
                        })?;
                    self.cache
                        .insert(chunk_key, CachedValue::Chunk(Arc::new(parsed.clone())));
                    parsed
                }
                // Descriptor without its chunk: tolerate and resume with
                // an empty chunk; the posting data is gone either way and
                // rebuild repairs it.
                None => {
                    tracing::warn!(field, chunk_id, "descriptor points at missing chunk");
                    Chunk::new(chunk_id, field, state.sparse.next_chunk_id)
                }
            }
        };
        state.loaded.insert(chunk_id, chunk);
        Ok(())
    }

    /// Read-only chunk snapshot for query evaluation.
    async fn chunk_snapshot(
        &self,
        state: &FieldState,
        field: &str,
        chunk_id: u32,
    ) -> Result<Arc<Chunk>, IndexError> {
        if let Some(chunk) = state.loaded.get(&chunk_id) {
            return Ok(Arc::new(chunk.clone()));
        }
        let chunk_key = keys::chunk(field, chunk_id);
        if let Some(cached) = self.cache.get_chunk(&chunk_key) {
            return Ok(cached);
        }
        match self.store.get_opt(&chunk_key).await? {
            Some(bytes) => {
                let parsed: Chunk =
                    serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupted {
                        path: chunk_key.clone(),
                        reason: e.to_string(),
                    })?;
                let arc = Arc::new(parsed);
                self.cache
                    .insert(chunk_key, CachedValue::Chunk(Arc::clone(&arc)));
                Ok(arc)
            }
            None => Ok(Arc::new(Chunk::new(chunk_id, field, 0))),
        }
    }

    // ===== Query path =====

    /// Evaluate a JSON query and return matching UUIDs.
    pub async fn query(
        &self,
        query: &Value,
        exact: &dyn ExactValueSource,
    ) -> Result<Vec<Uuid>, IndexError> {
        let predicate = Predicate::parse(query)?;
        let ids = planner::evaluate(self, &predicate, exact).await?;
        let interner = self.interner.lock().await;
        Ok(interner.bulk_resolve(ids.iter()))
    }

    /// Evaluate a pre-parsed predicate to an integer-id set.
    pub async fn query_ids(
        &self,
        predicate: &Predicate,
        exact: &dyn ExactValueSource,
    ) -> Result<IdSet, IndexError> {
        planner::evaluate(self, predicate, exact).await
    }

    /// Filtered, ordered, paginated UUIDs. Only (id, sort-key) pairs are
    /// materialized; pagination happens before anyone loads an entity.
    /// Temporal sort keys come from exact metadata values, not the
    /// bucketed index, to preserve precision.
    pub async fn query_sorted(
        &self,
        query: &Value,
        order_field: &str,
        descending: bool,
        offset: usize,
        limit: usize,
        exact: &dyn ExactValueSource,
    ) -> Result<Vec<Uuid>, IndexError> {
        let predicate = Predicate::parse(query)?;
        let matched = planner::evaluate(self, &predicate, exact).await?;
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        // Gather sort keys for the matched ids from the order field's
        // chunks.
        let mut keyed: HashMap<u32, IndexKey> = HashMap::new();
        let mut any_temporal = false;
        if let Some(state_arc) = self.field_state(order_field, false).await? {
            let state = state_arc.lock().await;
            for chunk_id in state.sparse.all_chunk_ids() {
                let chunk = self.chunk_snapshot(&state, order_field, chunk_id).await?;
                for (i, (key, ids)) in chunk.entries.iter().enumerate() {
                    let hits = ids.and(&matched);
                    if !hits.is_empty() {
                        if looks_temporal(key) {
                            any_temporal = true;
                        }
                        for id in hits.iter() {
                            keyed.insert(id, key.clone());
                        }
                    }
                    if i % YIELD_EVERY == YIELD_EVERY - 1 {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }

        let interner = self.interner.lock().await;
        let mut pairs: Vec<(Uuid, Option<SortKey>)> = Vec::new();
        for id in matched.iter() {
            let Some(uuid) = interner.resolve(id) else {
                continue;
            };
            pairs.push((uuid, keyed.get(&id).map(|k| SortKey::Indexed(k.clone()))));
        }
        drop(interner);

        if any_temporal {
            // Replace bucketed keys with exact millisecond values.
            let uuids: Vec<Uuid> = pairs
                .iter()
                .filter(|(_, k)| k.is_some())
                .map(|(u, _)| *u)
                .collect();
            let exact_values = exact.exact_values(&uuids, order_field).await?;
            for (uuid, key) in &mut pairs {
                if key.is_some() {
                    if let Some(ms) = exact_values
                        .get(uuid)
                        .and_then(normalize::exact_timestamp_ms)
                    {
                        *key = Some(SortKey::Exact(ms));
                    }
                }
            }
        }

        // Entities lacking the sort field order last in either direction.
        pairs.sort_by(|(_, a), (_, b)| match (a, b) {
            (Some(a), Some(b)) => {
                let ord = a.cmp(b);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        Ok(pairs
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(uuid, _)| uuid)
            .collect())
    }

    /// The "all live ids" bitmap, from the presence field every entity
    /// carries.
    pub(crate) async fn roster(&self) -> Result<IdSet, IndexError> {
        self.eval_key_eq(ALL_FIELD, &IndexKey::Str(PRESENT_KEY.to_string()))
            .await
    }

    /// Evaluate one predicate leaf to an id set. Compound combinators are
    /// the planner's job.
    pub(crate) async fn eval_leaf(
        &self,
        leaf: &Predicate,
        exact: &dyn ExactValueSource,
    ) -> Result<IdSet, IndexError> {
        match leaf {
            Predicate::Compare { field, op, value } => match op {
                CompareOp::Eq => self.eval_eq(field, value).await,
                CompareOp::Ne => {
                    let eq = self.eval_eq(field, value).await?;
                    // Entities lacking the field satisfy ne: complement
                    // over the live roster, not over field carriers.
                    Ok(self.roster().await?.and_not(&eq))
                }
                CompareOp::Gt => {
                    self.eval_range(field, Some((value, false)), None, exact).await
                }
                CompareOp::Gte => {
                    self.eval_range(field, Some((value, true)), None, exact).await
                }
                CompareOp::Lt => {
                    self.eval_range(field, None, Some((value, false)), exact).await
                }
                CompareOp::Lte => {
                    self.eval_range(field, None, Some((value, true)), exact).await
                }
            },
            Predicate::Between { field, lo, hi } => {
                self.eval_range(field, Some((lo, true)), Some((hi, true)), exact)
                    .await
            }
            Predicate::In { field, values } => {
                let mut acc = IdSet::new();
                for value in values {
                    acc.union_with(&self.eval_eq(field, value).await?);
                }
                Ok(acc)
            }
            // Multi-valued fields index one posting per element, so
            // containment is equality.
            Predicate::Contains { field, value } => self.eval_eq(field, value).await,
            Predicate::Exists { field, expected } => {
                let present = self.eval_presence(field).await?;
                if *expected {
                    Ok(present)
                } else {
                    Ok(self.roster().await?.and_not(&present))
                }
            }
            Predicate::Text { field, op, pattern } => {
                self.eval_text(field, *op, pattern).await
            }
            Predicate::All(_) | Predicate::Any(_) | Predicate::Not(_) => {
                unreachable!("combinators are evaluated by the planner")
            }
        }
    }

    async fn eval_eq(&self, field: &str, value: &Value) -> Result<IdSet, IndexError> {
        // Word tokens are raw FNV hashes and can land inside the numeric
        // timestamp-detection window; the synthetic field bypasses
        // normalization entirely, matching the write side.
        if field == normalize::WORDS_FIELD {
            let Some(token) = value.as_f64() else {
                return Ok(IdSet::new());
            };
            return self.eval_key_eq(field, &IndexKey::Num(token)).await;
        }
        let Some(normalized) = normalize_value(value, NormalizeOptions::default()) else {
            return Ok(IdSet::new());
        };
        let key = self.adjust_key(field, normalized.key);
        self.eval_key_eq(field, &key).await
    }

    async fn eval_key_eq(&self, field: &str, key: &IndexKey) -> Result<IdSet, IndexError> {
        let Some(state_arc) = self.field_state(field, false).await? else {
            return Ok(IdSet::new());
        };
        let state = state_arc.lock().await;
        let mut acc = IdSet::new();
        for chunk_id in state.sparse.find_chunks_for_value(key) {
            let chunk = self.chunk_snapshot(&state, field, chunk_id).await?;
            if let Some(ids) = chunk.entries.get(key) {
                acc.union_with(ids);
            }
        }
        Ok(acc)
    }

    /// Range evaluation. Bucketed (temporal) bounds admit their whole
    /// boundary bucket from the index, then refine those candidates
    /// against exact metadata values so results honor the original bounds.
    async fn eval_range(
        &self,
        field: &str,
        lo: Option<(&Value, bool)>,
        hi: Option<(&Value, bool)>,
        exact: &dyn ExactValueSource,
    ) -> Result<IdSet, IndexError> {
        let normalize_bound = |bound: Option<(&Value, bool)>| -> Option<(Normalized, bool)> {
            bound.and_then(|(value, inclusive)| {
                normalize_value(value, NormalizeOptions::default()).map(|n| (n, inclusive))
            })
        };
        let lo_n = normalize_bound(lo);
        let hi_n = normalize_bound(hi);
        if lo.is_some() && lo_n.is_none() || hi.is_some() && hi_n.is_none() {
            // A bound that cannot normalize (object/array) matches nothing.
            return Ok(IdSet::new());
        }

        // Bucketed bounds widen to include their whole boundary bucket.
        let lo_key = lo_n.as_ref().map(|(n, _)| self.adjust_key(field, n.key.clone()));
        let hi_key = hi_n.as_ref().map(|(n, _)| self.adjust_key(field, n.key.clone()));
        let lo_incl_eff = lo_n.as_ref().map(|(n, incl)| n.bucketed || *incl);
        let hi_incl_eff = hi_n.as_ref().map(|(n, incl)| n.bucketed || *incl);

        if let (Some(lo_key), Some(hi_key)) = (&lo_key, &hi_key) {
            if lo_key > hi_key {
                return Ok(IdSet::new());
            }
        }

        let Some(state_arc) = self.field_state(field, false).await? else {
            return Ok(IdSet::new());
        };
        let state = state_arc.lock().await;

        let chunk_ids = state.sparse.find_chunks_for_range(
            lo_key.as_ref(),
            lo_incl_eff.unwrap_or(true),
            hi_key.as_ref(),
            hi_incl_eff.unwrap_or(true),
        );

        let range_start = match (&lo_key, lo_incl_eff) {
            (Some(k), Some(true)) => Bound::Included(k.clone()),
            (Some(k), Some(false)) => Bound::Excluded(k.clone()),
            _ => Bound::Unbounded,
        };
        let range_end = match (&hi_key, hi_incl_eff) {
            (Some(k), Some(true)) => Bound::Included(k.clone()),
            (Some(k), Some(false)) => Bound::Excluded(k.clone()),
            _ => Bound::Unbounded,
        };

        let mut acc = IdSet::new();
        let mut boundary = IdSet::new();
        let lo_boundary_key = lo_n
            .as_ref()
            .filter(|(n, _)| n.bucketed)
            .map(|(n, _)| n.key.clone());
        let hi_boundary_key = hi_n
            .as_ref()
            .filter(|(n, _)| n.bucketed)
            .map(|(n, _)| n.key.clone());

        for chunk_id in chunk_ids {
            let chunk = self.chunk_snapshot(&state, field, chunk_id).await?;
            for (i, (key, ids)) in chunk
                .entries
                .range((range_start.clone(), range_end.clone()))
                .enumerate()
            {
                // Only number keys participate in numeric/temporal ranges;
                // string keys live above all numbers in the key order.
                if matches!(key, IndexKey::Str(_)) {
                    continue;
                }
                let on_boundary = lo_boundary_key.as_ref() == Some(key)
                    || hi_boundary_key.as_ref() == Some(key);
                if on_boundary {
                    boundary.union_with(ids);
                } else {
                    acc.union_with(ids);
                }
                if i % YIELD_EVERY == YIELD_EVERY - 1 {
                    tokio::task::yield_now().await;
                }
            }
        }
        drop(state);

        if !boundary.is_empty() {
            acc.union_with(
                &self
                    .refine_boundary(field, boundary, &lo_n, &hi_n, exact)
                    .await?,
            );
        }
        Ok(acc)
    }

    /// Check boundary-bucket candidates against exact metadata values,
    /// honoring the caller's original bounds and inclusivity.
    async fn refine_boundary(
        &self,
        field: &str,
        boundary: IdSet,
        lo: &Option<(Normalized, bool)>,
        hi: &Option<(Normalized, bool)>,
        exact: &dyn ExactValueSource,
    ) -> Result<IdSet, IndexError> {
        let (uuids, id_of) = {
            let interner = self.interner.lock().await;
            let uuids = interner.bulk_resolve(boundary.iter());
            let id_of: HashMap<Uuid, u32> = uuids
                .iter()
                .filter_map(|u| interner.get(u).map(|i| (*u, i)))
                .collect();
            (uuids, id_of)
        };
        let exact_values = exact.exact_values(&uuids, field).await?;

        let bound_ms = |b: &Option<(Normalized, bool)>| {
            b.as_ref().map(|(n, incl)| {
                let limit = n.exact_ms.or_else(|| n.key.as_num()).unwrap_or(f64::NAN);
                (limit, *incl)
            })
        };
        let lo_b = bound_ms(lo);
        let hi_b = bound_ms(hi);

        let mut kept = IdSet::new();
        for (uuid, value) in &exact_values {
            let Some(actual) = normalize::exact_timestamp_ms(value)
                .or_else(|| value.as_f64())
            else {
                continue;
            };
            if let Some((limit, incl)) = lo_b {
                if actual < limit || (!incl && actual == limit) {
                    continue;
                }
            }
            if let Some((limit, incl)) = hi_b {
                if actual > limit || (!incl && actual == limit) {
                    continue;
                }
            }
            if let Some(&int_id) = id_of.get(uuid) {
                kept.add(int_id);
            }
        }
        Ok(kept)
    }

    /// Union of every posting of a field (the `exists` bitmap).
    async fn eval_presence(&self, field: &str) -> Result<IdSet, IndexError> {
        let Some(state_arc) = self.field_state(field, false).await? else {
            return Ok(IdSet::new());
        };
        let state = state_arc.lock().await;
        let mut acc = IdSet::new();
        for chunk_id in state.sparse.all_chunk_ids() {
            let chunk = self.chunk_snapshot(&state, field, chunk_id).await?;
            for (i, ids) in chunk.entries.values().enumerate() {
                acc.union_with(ids);
                if i % YIELD_EVERY == YIELD_EVERY - 1 {
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(acc)
    }

    /// String predicates by candidate-chunk scan; there is no accelerated
    /// index for these.
    async fn eval_text(
        &self,
        field: &str,
        op: TextOp,
        pattern: &str,
    ) -> Result<IdSet, IndexError> {
        let regex = match op {
            TextOp::Matches => Some(regex::Regex::new(pattern)?),
            _ => None,
        };
        let Some(state_arc) = self.field_state(field, false).await? else {
            return Ok(IdSet::new());
        };
        let state = state_arc.lock().await;
        let mut acc = IdSet::new();
        for chunk_id in state.sparse.all_chunk_ids() {
            let chunk = self.chunk_snapshot(&state, field, chunk_id).await?;
            for (i, (key, ids)) in chunk.entries.iter().enumerate() {
                if let IndexKey::Str(s) = key {
                    let hit = match op {
                        TextOp::StartsWith => s.starts_with(pattern),
                        TextOp::EndsWith => s.ends_with(pattern),
                        TextOp::Matches => {
                            regex.as_ref().expect("compiled above").is_match(s)
                        }
                    };
                    if hit {
                        acc.union_with(ids);
                    }
                }
                if i % YIELD_EVERY == YIELD_EVERY - 1 {
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(acc)
    }

    /// Rough result-size estimate for a leaf, for conjunct ordering. Never
    /// loads chunks; descriptors only.
    pub(crate) async fn estimate_leaf(&self, leaf: &Predicate) -> u64 {
        let field = match leaf {
            Predicate::Compare { field, .. }
            | Predicate::In { field, .. }
            | Predicate::Between { field, .. }
            | Predicate::Contains { field, .. }
            | Predicate::Exists { field, .. }
            | Predicate::Text { field, .. } => field,
            _ => return u64::MAX,
        };
        let Ok(Some(state_arc)) = self.field_state(field, false).await else {
            return 0;
        };
        let state = state_arc.lock().await;
        let postings = state.sparse.total_posting_count();
        let distinct = state.sparse.total_entry_count().max(1);
        let avg_per_value = (postings / distinct).max(1);

        match leaf {
            Predicate::Compare { op: CompareOp::Eq, .. } | Predicate::Contains { .. } => {
                avg_per_value
            }
            Predicate::In { values, .. } => avg_per_value * values.len() as u64,
            Predicate::Between { .. }
            | Predicate::Compare {
                op: CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte,
                ..
            } => postings / 2,
            Predicate::Exists { expected: true, .. } => postings,
            // Complement-shaped leaves are the least selective.
            Predicate::Compare { op: CompareOp::Ne, .. }
            | Predicate::Exists { expected: false, .. }
            | Predicate::Text { .. } => u64::MAX / 2,
            _ => u64::MAX,
        }
    }

    fn adjust_key(&self, field: &str, key: IndexKey) -> IndexKey {
        let high_card = self.high_cardinality.lock().expect("flag set poisoned");
        if high_card.contains(field) {
            if let IndexKey::Num(n) = key {
                return IndexKey::Num((n * 100.0).round() / 100.0);
            }
        }
        key
    }

    // ===== Persistence =====

    /// Persist every dirty chunk, routing directory, value-count
    /// directory, the field registry, statistics, and the id mapper. An
    /// index add is externally visible only after its chunk save and the
    /// matching sparse-index save have both happened.
    pub async fn flush(&self) -> Result<(), IndexError> {
        let snapshot: Vec<(String, Arc<Mutex<FieldState>>)> = {
            let fields = self.fields.read().await;
            fields
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        for (field, state_arc) in snapshot {
            let mut state = state_arc.lock().await;
            if state.dirty.is_empty() && state.deleted.is_empty() && !state.sparse_dirty {
                continue;
            }

            let dirty: Vec<u32> = state.dirty.iter().copied().collect();
            for chunk_id in dirty {
                let chunk = state.loaded.get(&chunk_id).expect("dirty implies loaded");
                let bytes = serde_json::to_vec(chunk).map_err(|e| IndexError::Corrupted {
                    path: keys::chunk(&field, chunk_id),
                    reason: e.to_string(),
                })?;
                self.writer.write(&keys::chunk(&field, chunk_id), bytes).await?;
                // Clean snapshot becomes cache-resident; the overlay entry
                // is dropped below.
                self.cache.insert(
                    keys::chunk(&field, chunk_id),
                    CachedValue::Chunk(Arc::new(chunk.clone())),
                );
            }
            for chunk_id in state.deleted.iter().copied().collect::<Vec<u32>>() {
                self.writer.delete(&keys::chunk(&field, chunk_id)).await?;
            }

            let sparse_key = keys::sparse_index(&field);
            if state.sparse.is_empty() {
                self.writer.delete(&sparse_key).await?;
                self.writer.delete(&keys::field_index(&field)).await?;
                self.cache.remove(&sparse_key);
            } else {
                let bytes =
                    serde_json::to_vec(&state.sparse).map_err(|e| IndexError::Corrupted {
                        path: sparse_key.clone(),
                        reason: e.to_string(),
                    })?;
                self.writer.write(&sparse_key, bytes).await?;
                self.cache.insert(
                    sparse_key,
                    CachedValue::Sparse(Arc::new(state.sparse.clone())),
                );

                let counts_bytes = serde_json::to_vec(&state.value_counts)
                    .map_err(|e| IndexError::Corrupted {
                        path: keys::field_index(&field),
                        reason: e.to_string(),
                    })?;
                self.writer
                    .write(&keys::field_index(&field), counts_bytes)
                    .await?;
            }

            state.loaded.clear();
            state.dirty.clear();
            state.deleted.clear();
            state.sparse_dirty = false;
        }

        {
            let mut registry = self.registry.lock().await;
            if registry.dirty {
                let bytes = serde_json::to_vec(&registry.fields)
                    .map_err(|e| IndexError::Corrupted {
                        path: keys::FIELD_REGISTRY.to_string(),
                        reason: e.to_string(),
                    })?;
                self.writer.write(keys::FIELD_REGISTRY, bytes).await?;
                registry.dirty = false;
            }
        }
        {
            let stats = self.stats.lock().await;
            let bytes = serde_json::to_vec(&*stats).map_err(|e| IndexError::Corrupted {
                path: keys::STATISTICS.to_string(),
                reason: e.to_string(),
            })?;
            self.writer.write(keys::STATISTICS, bytes).await?;
        }
        self.interner.lock().await.flush(self.store.as_ref()).await?;
        self.writer.flush().await?;
        tracing::debug!("metadata index flushed");
        Ok(())
    }

    /// Drop every index structure, in memory and persisted: all chunks,
    /// all sparse indices, value counts, the registry, statistics, and the
    /// id mapper. Rebuild starts from here.
    pub async fn clear_all(&self) -> Result<(), IndexError> {
        self.fields.write().await.clear();
        self.cache.clear();
        {
            let mut registry = self.registry.lock().await;
            registry.fields.clear();
            registry.dirty = true;
        }
        *self.stats.lock().await = IndexStats::default();
        self.high_cardinality
            .lock()
            .expect("flag set poisoned")
            .clear();
        self.interner.lock().await.clear();

        use futures::TryStreamExt;
        let mut doomed: Vec<String> = self
            .store
            .list(keys::SPARSE_INDEX_PREFIX)
            .try_collect()
            .await?;
        let field_objects: Vec<String> = self
            .store
            .list(keys::FIELD_INDEX_PREFIX)
            .try_collect()
            .await?;
        doomed.extend(field_objects);
        self.store
            .batch_delete(&doomed, BatchDeleteOptions::default())
            .await?;
        self.store.delete(keys::FIELD_REGISTRY).await?;
        self.store.delete(keys::STATISTICS).await?;
        self.store.delete(keys::ID_MAPPER).await?;
        tracing::info!(objects = doomed.len(), "index cleared");
        Ok(())
    }
}

/// Sort key: indexed (possibly bucketed) or exact milliseconds.
#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Indexed(IndexKey),
    Exact(f64),
}

impl SortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (SortKey::Indexed(a), SortKey::Indexed(b)) => a.cmp(b),
            (SortKey::Exact(a), SortKey::Exact(b)) => a.total_cmp(b),
            // Mixed: compare in number space where possible.
            (SortKey::Exact(a), SortKey::Indexed(b)) => match b.as_num() {
                Some(b) => a.total_cmp(&b),
                None => std::cmp::Ordering::Less,
            },
            (SortKey::Indexed(a), SortKey::Exact(b)) => match a.as_num() {
                Some(a) => a.total_cmp(b),
                None => std::cmp::Ordering::Greater,
            },
        }
    }
}

/// Millisecond-window check used to spot bucketed temporal keys.
fn looks_temporal(key: &IndexKey) -> bool {
    key.as_num()
        .is_some_and(|n| (946_684_800_000.0..4_102_444_800_000.0).contains(&n))
}
