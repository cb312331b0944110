//! Entity persistence: the two-file model over the object store.
//!
//! Every noun persists as a **vector record** (id + embedding) and a
//! **metadata record** (type + metadata), under shard-routed keys; its
//! graph placement is a third record owned by [`crate::graph`]. Verbs
//! carry two records, with the relationship core fields (source, target,
//! type) on the vector record so traversal never loads verb metadata.
//! The split is load-critical: graph traversal must not pay for metadata,
//! and predicate evaluation must not pay for vectors.
//!
//! Aggregate counts live in `_system/counts.json`, loaded at startup and
//! reconstructed by a prefix scan when absent.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::index::ExactValueSource;
use crate::model::{Metadata, Noun, NounType, Verb, VerbType};
use crate::storage::{keys, ObjectStore, StorageError};
use crate::writebuf::WriteBuffer;

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("entity record corrupted at {path}: {reason}")]
    Corrupted { path: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Cached entities per kind.
const ENTITY_CACHE_CAP: usize = 4096;

/// Page size used when a caller does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Serialize, Deserialize)]
struct NounVectorRecord {
    id: Uuid,
    vector: Vec<f32>,
    #[serde(flatten)]
    extra: Metadata,
}

#[derive(Serialize, Deserialize)]
struct NounMetadataRecord {
    id: Uuid,
    #[serde(rename = "type")]
    noun_type: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(flatten)]
    extra: Metadata,
}

#[derive(Serialize, Deserialize)]
struct VerbVectorRecord {
    id: Uuid,
    #[serde(rename = "type")]
    verb_type: String,
    source: Uuid,
    target: Uuid,
    vector: Vec<f32>,
    #[serde(flatten)]
    extra: Metadata,
}

#[derive(Serialize, Deserialize)]
struct VerbMetadataRecord {
    id: Uuid,
    #[serde(default)]
    metadata: Metadata,
    #[serde(flatten)]
    extra: Metadata,
}

/// Aggregate entity counts, persisted under `_system/counts.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub total_nouns: u64,
    pub total_verbs: u64,
    #[serde(default)]
    pub noun_types: BTreeMap<String, u64>,
    #[serde(default)]
    pub verb_types: BTreeMap<String, u64>,
}

/// One page of a type-filtered listing. The cursor is opaque to callers;
/// feed it back verbatim to continue.
pub struct NounPage {
    pub items: Vec<(Uuid, String, Metadata)>,
    pub cursor: Option<String>,
}

/// One page of a verb listing: (id, type name, source, target, metadata).
pub struct VerbPage {
    pub items: Vec<(Uuid, String, Uuid, Uuid, Metadata)>,
    pub cursor: Option<String>,
}

/// Per-type sharded persistence of nouns and verbs.
pub struct EntityStore {
    store: Arc<dyn ObjectStore>,
    writer: Arc<WriteBuffer>,
    nouns: std::sync::Mutex<LruCache<Uuid, Noun>>,
    verbs: std::sync::Mutex<LruCache<Uuid, Verb>>,
    counts: Mutex<(EntityCounts, bool)>,
}

impl EntityStore {
    pub fn new(store: Arc<dyn ObjectStore>, writer: Arc<WriteBuffer>) -> Self {
        let cap = NonZeroUsize::new(ENTITY_CACHE_CAP).expect("nonzero");
        Self {
            store,
            writer,
            nouns: std::sync::Mutex::new(LruCache::new(cap)),
            verbs: std::sync::Mutex::new(LruCache::new(cap)),
            counts: Mutex::new((EntityCounts::default(), false)),
        }
    }

    /// Load counts from the system record, reconstructing them with a
    /// prefix scan when the record is absent (fresh database or crash
    /// before the first counts flush).
    pub async fn init(&self) -> Result<(), EntityError> {
        match self.store.get_opt(keys::COUNTS).await? {
            Some(bytes) => {
                let loaded: EntityCounts =
                    serde_json::from_slice(&bytes).map_err(|e| EntityError::Corrupted {
                        path: keys::COUNTS.to_string(),
                        reason: e.to_string(),
                    })?;
                *self.counts.lock().await = (loaded, false);
            }
            None => {
                let rebuilt = self.scan_counts().await?;
                tracing::info!(
                    nouns = rebuilt.total_nouns,
                    verbs = rebuilt.total_verbs,
                    "counts record absent; reconstructed by scan"
                );
                *self.counts.lock().await = (rebuilt, true);
            }
        }
        Ok(())
    }

    async fn scan_counts(&self) -> Result<EntityCounts, EntityError> {
        let mut counts = EntityCounts::default();

        let noun_keys: Vec<String> = self
            .store
            .list(keys::NOUN_METADATA_PREFIX)
            .try_collect()
            .await?;
        counts.total_nouns = noun_keys.len() as u64;
        let records = self.store.batch_read(&noun_keys).await?;
        for bytes in records.values() {
            if let Ok(record) = serde_json::from_slice::<NounMetadataRecord>(bytes) {
                *counts.noun_types.entry(record.noun_type).or_insert(0) += 1;
            }
        }

        let verb_keys: Vec<String> = self
            .store
            .list(keys::VERB_VECTOR_PREFIX)
            .try_collect()
            .await?;
        counts.total_verbs = verb_keys.len() as u64;
        let records = self.store.batch_read(&verb_keys).await?;
        for bytes in records.values() {
            if let Ok(record) = serde_json::from_slice::<VerbVectorRecord>(bytes) {
                *counts.verb_types.entry(record.verb_type).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    pub async fn counts(&self) -> EntityCounts {
        self.counts.lock().await.0.clone()
    }

    // ===== Nouns =====

    /// Persist a noun's vector and metadata records. Returns true when the
    /// noun is new (counts were incremented).
    pub async fn save_noun(&self, noun: &Noun) -> Result<bool, EntityError> {
        let metadata_key = keys::noun_metadata(&noun.id);
        let existed = self.store.get_opt(&metadata_key).await?.is_some();

        let vector_record = NounVectorRecord {
            id: noun.id,
            vector: noun.vector.clone(),
            extra: Metadata::new(),
        };
        let metadata_record = NounMetadataRecord {
            id: noun.id,
            noun_type: noun.noun_type.as_str().to_string(),
            metadata: noun.metadata.clone(),
            extra: Metadata::new(),
        };
        self.writer
            .write(
                &keys::noun_vector(&noun.id),
                encode(&keys::noun_vector(&noun.id), &vector_record)?,
            )
            .await?;
        self.writer
            .write(&metadata_key, encode(&metadata_key, &metadata_record)?)
            .await?;

        self.cache_noun(noun.clone());
        if !existed {
            let mut counts = self.counts.lock().await;
            counts.0.total_nouns += 1;
            *counts
                .0
                .noun_types
                .entry(noun.noun_type.as_str().to_string())
                .or_insert(0) += 1;
            counts.1 = true;
        }
        tracing::debug!(noun = %noun.id, new = !existed, "noun saved");
        Ok(!existed)
    }

    /// Rewrite a noun's metadata record only; the vector record stays
    /// untouched.
    pub async fn save_noun_metadata(
        &self,
        id: Uuid,
        noun_type: NounType,
        metadata: &Metadata,
    ) -> Result<(), EntityError> {
        let key = keys::noun_metadata(&id);
        let record = NounMetadataRecord {
            id,
            noun_type: noun_type.as_str().to_string(),
            metadata: metadata.clone(),
            extra: Metadata::new(),
        };
        self.writer.write(&key, encode(&key, &record)?).await?;
        self.nouns.lock().expect("cache poisoned").pop(&id);
        Ok(())
    }

    pub async fn load_noun(&self, id: &Uuid) -> Result<Option<Noun>, EntityError> {
        if let Some(cached) = self.cached_noun(id) {
            return Ok(Some(cached));
        }

        let vector_key = keys::noun_vector(id);
        let metadata_key = keys::noun_metadata(id);
        let records = self
            .store
            .batch_read(&[vector_key.clone(), metadata_key.clone()])
            .await?;
        let Some(metadata_bytes) = records.get(&metadata_key) else {
            return Ok(None);
        };
        let metadata_record: NounMetadataRecord = serde_json::from_slice(metadata_bytes)
            .map_err(|e| EntityError::Corrupted {
                path: metadata_key,
                reason: e.to_string(),
            })?;
        // Missing vector record is the lazy-load sentinel: the noun exists
        // with an empty vector and is deliberately not cached.
        let vector = match records.get(&vector_key) {
            Some(bytes) => {
                let record: NounVectorRecord =
                    serde_json::from_slice(bytes).map_err(|e| EntityError::Corrupted {
                        path: vector_key,
                        reason: e.to_string(),
                    })?;
                record.vector
            }
            None => Vec::new(),
        };

        let noun = Noun {
            id: *id,
            noun_type: NounType::from_name(&metadata_record.noun_type),
            vector,
            metadata: metadata_record.metadata,
        };
        self.cache_noun(noun.clone());
        Ok(Some(noun))
    }

    /// Metadata record alone: type name plus metadata map. The read path
    /// for exact values, deletes without provided metadata, and rebuild.
    pub async fn load_noun_metadata(
        &self,
        id: &Uuid,
    ) -> Result<Option<(String, Metadata)>, EntityError> {
        let key = keys::noun_metadata(id);
        let Some(bytes) = self.store.get_opt(&key).await? else {
            return Ok(None);
        };
        let record: NounMetadataRecord =
            serde_json::from_slice(&bytes).map_err(|e| EntityError::Corrupted {
                path: key,
                reason: e.to_string(),
            })?;
        Ok(Some((record.noun_type, record.metadata)))
    }

    pub async fn delete_noun(&self, id: &Uuid, noun_type: &str) -> Result<(), EntityError> {
        let existed = self.store.get_opt(&keys::noun_metadata(id)).await?.is_some();
        self.writer.delete(&keys::noun_vector(id)).await?;
        self.writer.delete(&keys::noun_metadata(id)).await?;
        self.nouns.lock().expect("cache poisoned").pop(id);

        if existed {
            let mut counts = self.counts.lock().await;
            counts.0.total_nouns = counts.0.total_nouns.saturating_sub(1);
            if let Some(per_type) = counts.0.noun_types.get_mut(noun_type) {
                *per_type = per_type.saturating_sub(1);
            }
            counts.1 = true;
        }
        tracing::debug!(noun = %id, "noun deleted");
        Ok(())
    }

    /// Paginated listing of noun metadata, optionally filtered by type.
    /// The cursor is the last storage key processed, returned opaque.
    pub async fn list_nouns(
        &self,
        type_filter: Option<&str>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<NounPage, EntityError> {
        let page_size = page_size.max(1);
        let all_keys: Vec<String> = self
            .store
            .list(keys::NOUN_METADATA_PREFIX)
            .try_collect()
            .await?;
        let start = match cursor {
            Some(cursor) => all_keys.partition_point(|k| k.as_str() <= cursor),
            None => 0,
        };

        let mut items = Vec::with_capacity(page_size);
        let mut last_key = None;
        for window in all_keys[start..].chunks(page_size.max(16)) {
            let records = self.store.batch_read(window).await?;
            // batch_read returns a map; preserve listing order
            for key in window {
                let Some(bytes) = records.get(key) else {
                    continue;
                };
                let record: NounMetadataRecord = match serde_json::from_slice(bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping unreadable noun record");
                        continue;
                    }
                };
                last_key = Some(key.clone());
                if let Some(wanted) = type_filter {
                    if record.noun_type != wanted {
                        continue;
                    }
                }
                items.push((record.id, record.noun_type, record.metadata));
                if items.len() >= page_size {
                    break;
                }
            }
            if items.len() >= page_size {
                break;
            }
        }

        let exhausted = match &last_key {
            Some(last) => all_keys.last().map(String::as_str) == Some(last.as_str()),
            None => true,
        };
        Ok(NounPage {
            items,
            cursor: if exhausted { None } else { last_key },
        })
    }

    // ===== Verbs =====

    pub async fn save_verb(&self, verb: &Verb) -> Result<bool, EntityError> {
        let vector_key = keys::verb_vector(&verb.id);
        let existed = self.store.get_opt(&vector_key).await?.is_some();

        let vector_record = VerbVectorRecord {
            id: verb.id,
            verb_type: verb.verb_type.as_str().to_string(),
            source: verb.source,
            target: verb.target,
            vector: verb.vector.clone(),
            extra: Metadata::new(),
        };
        let metadata_key = keys::verb_metadata(&verb.id);
        let metadata_record = VerbMetadataRecord {
            id: verb.id,
            metadata: verb.metadata.clone(),
            extra: Metadata::new(),
        };
        self.writer
            .write(&vector_key, encode(&vector_key, &vector_record)?)
            .await?;
        self.writer
            .write(&metadata_key, encode(&metadata_key, &metadata_record)?)
            .await?;

        self.cache_verb(verb.clone());
        if !existed {
            let mut counts = self.counts.lock().await;
            counts.0.total_verbs += 1;
            *counts
                .0
                .verb_types
                .entry(verb.verb_type.as_str().to_string())
                .or_insert(0) += 1;
            counts.1 = true;
        }
        tracing::debug!(verb = %verb.id, new = !existed, "verb saved");
        Ok(!existed)
    }

    pub async fn load_verb(&self, id: &Uuid) -> Result<Option<Verb>, EntityError> {
        if let Some(cached) = self.cached_verb(id) {
            return Ok(Some(cached));
        }

        let vector_key = keys::verb_vector(id);
        let metadata_key = keys::verb_metadata(id);
        let records = self
            .store
            .batch_read(&[vector_key.clone(), metadata_key.clone()])
            .await?;
        let Some(vector_bytes) = records.get(&vector_key) else {
            return Ok(None);
        };
        let vector_record: VerbVectorRecord = serde_json::from_slice(vector_bytes)
            .map_err(|e| EntityError::Corrupted {
                path: vector_key,
                reason: e.to_string(),
            })?;
        let metadata = match records.get(&metadata_key) {
            Some(bytes) => {
                let record: VerbMetadataRecord =
                    serde_json::from_slice(bytes).map_err(|e| EntityError::Corrupted {
                        path: metadata_key,
                        reason: e.to_string(),
                    })?;
                record.metadata
            }
            None => Metadata::new(),
        };

        let verb = Verb {
            id: *id,
            verb_type: VerbType::from_name(&vector_record.verb_type),
            source: vector_record.source,
            target: vector_record.target,
            vector: vector_record.vector,
            metadata,
        };
        self.cache_verb(verb.clone());
        Ok(Some(verb))
    }

    pub async fn load_verb_metadata(
        &self,
        id: &Uuid,
    ) -> Result<Option<Metadata>, EntityError> {
        let key = keys::verb_metadata(id);
        let Some(bytes) = self.store.get_opt(&key).await? else {
            return Ok(None);
        };
        let record: VerbMetadataRecord =
            serde_json::from_slice(&bytes).map_err(|e| EntityError::Corrupted {
                path: key,
                reason: e.to_string(),
            })?;
        Ok(Some(record.metadata))
    }

    pub async fn delete_verb(&self, id: &Uuid, verb_type: &str) -> Result<(), EntityError> {
        let existed = self.store.get_opt(&keys::verb_vector(id)).await?.is_some();
        self.writer.delete(&keys::verb_vector(id)).await?;
        self.writer.delete(&keys::verb_metadata(id)).await?;
        self.verbs.lock().expect("cache poisoned").pop(id);

        if existed {
            let mut counts = self.counts.lock().await;
            counts.0.total_verbs = counts.0.total_verbs.saturating_sub(1);
            if let Some(per_type) = counts.0.verb_types.get_mut(verb_type) {
                *per_type = per_type.saturating_sub(1);
            }
            counts.1 = true;
        }
        Ok(())
    }

    /// Paginated listing of verbs with their core fields and metadata.
    /// Core fields come off the vector record; metadata is batch-fetched
    /// for the page only.
    pub async fn list_verbs(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<VerbPage, EntityError> {
        let page_size = page_size.max(1);
        let all_keys: Vec<String> = self
            .store
            .list(keys::VERB_VECTOR_PREFIX)
            .try_collect()
            .await?;
        let start = match cursor {
            Some(cursor) => all_keys.partition_point(|k| k.as_str() <= cursor),
            None => 0,
        };
        let window: Vec<String> = all_keys[start..]
            .iter()
            .take(page_size)
            .cloned()
            .collect();

        let vector_records = self.store.batch_read(&window).await?;
        let mut cores = Vec::with_capacity(window.len());
        for key in &window {
            let Some(bytes) = vector_records.get(key) else {
                continue;
            };
            match serde_json::from_slice::<VerbVectorRecord>(bytes) {
                Ok(record) => cores.push(record),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable verb record");
                }
            }
        }

        let metadata_keys: Vec<String> =
            cores.iter().map(|r| keys::verb_metadata(&r.id)).collect();
        let metadata_records = self.store.batch_read(&metadata_keys).await?;
        let items = cores
            .into_iter()
            .map(|core| {
                let metadata = metadata_records
                    .get(&keys::verb_metadata(&core.id))
                    .and_then(|bytes| {
                        serde_json::from_slice::<VerbMetadataRecord>(bytes).ok()
                    })
                    .map(|r| r.metadata)
                    .unwrap_or_default();
                (core.id, core.verb_type, core.source, core.target, metadata)
            })
            .collect();

        let cursor = if start + window.len() >= all_keys.len() {
            None
        } else {
            window.last().cloned()
        };
        Ok(VerbPage { items, cursor })
    }

    // ===== Persistence =====

    /// Write the counts record if it changed since the last flush.
    pub async fn flush(&self) -> Result<(), EntityError> {
        let mut counts = self.counts.lock().await;
        if !counts.1 {
            return Ok(());
        }
        let bytes = encode(keys::COUNTS, &counts.0)?;
        self.writer.write(keys::COUNTS, bytes).await?;
        counts.1 = false;
        Ok(())
    }

    /// Drop cached entities and reset counts. Rebuild plumbing.
    pub async fn clear_caches(&self) {
        self.nouns.lock().expect("cache poisoned").clear();
        self.verbs.lock().expect("cache poisoned").clear();
    }

    // ===== Cache discipline =====

    /// A record with an empty vector is the lazy-load sentinel; caching it
    /// would poison every later read, so it is refused.
    fn cache_noun(&self, noun: Noun) {
        if noun.vector.is_empty() {
            return;
        }
        self.nouns.lock().expect("cache poisoned").push(noun.id, noun);
    }

    fn cached_noun(&self, id: &Uuid) -> Option<Noun> {
        let mut cache = self.nouns.lock().expect("cache poisoned");
        match cache.get(id) {
            Some(noun) if noun.vector.is_empty() || noun.id != *id => {
                // Validation failure: treat as a miss and delete.
                cache.pop(id);
                None
            }
            Some(noun) => Some(noun.clone()),
            None => None,
        }
    }

    fn cache_verb(&self, verb: Verb) {
        if verb.vector.is_empty() {
            return;
        }
        self.verbs.lock().expect("cache poisoned").push(verb.id, verb);
    }

    fn cached_verb(&self, id: &Uuid) -> Option<Verb> {
        let mut cache = self.verbs.lock().expect("cache poisoned");
        match cache.get(id) {
            Some(verb) if verb.vector.is_empty() || verb.id != *id => {
                cache.pop(id);
                None
            }
            Some(verb) => Some(verb.clone()),
            None => None,
        }
    }
}

fn encode<T: Serialize>(path: &str, record: &T) -> Result<Vec<u8>, EntityError> {
    serde_json::to_vec(record).map_err(|e| EntityError::Corrupted {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Look a field up in a metadata map the same way extraction sees it:
/// top-level key, the flattened `metadata` wrapper, and the `type` →
/// `noun` rename.
pub fn metadata_field_value(type_name: &str, metadata: &Metadata, field: &str) -> Option<Value> {
    if field == crate::index::normalize::TYPE_FIELD {
        return Some(Value::String(type_name.to_string()));
    }
    if let Some(value) = metadata.get(field) {
        return Some(value.clone());
    }
    if let Some(Value::Object(inner)) = metadata.get("metadata") {
        return inner.get(field).cloned();
    }
    None
}

#[async_trait]
impl ExactValueSource for EntityStore {
    async fn exact_values(
        &self,
        ids: &[Uuid],
        field: &str,
    ) -> Result<HashMap<Uuid, Value>, StorageError> {
        let noun_keys: Vec<String> = ids.iter().map(keys::noun_metadata).collect();
        let mut records = self.store.batch_read(&noun_keys).await?;
        let verb_ids: Vec<&Uuid> = ids
            .iter()
            .zip(&noun_keys)
            .filter(|(_, key)| !records.contains_key(*key))
            .map(|(id, _)| id)
            .collect();
        if !verb_ids.is_empty() {
            let verb_keys: Vec<String> =
                verb_ids.iter().map(|id| keys::verb_metadata(id)).collect();
            records.extend(self.store.batch_read(&verb_keys).await?);
        }

        let mut out = HashMap::with_capacity(records.len());
        for id in ids {
            let value = if let Some(bytes) = records.get(&keys::noun_metadata(id)) {
                serde_json::from_slice::<NounMetadataRecord>(bytes)
                    .ok()
                    .and_then(|r| metadata_field_value(&r.noun_type, &r.metadata, field))
            } else if let Some(bytes) = records.get(&keys::verb_metadata(id)) {
                serde_json::from_slice::<VerbMetadataRecord>(bytes)
                    .ok()
                    .and_then(|r| metadata_field_value("", &r.metadata, field))
            } else {
                None
            };
            if let Some(value) = value {
                out.insert(*id, value);
            }
        }
        Ok(out)
    }
}
