//! The engine handle: one object owning every piece of shared state.
//!
//! An [`Engine`] wires the object store, write buffer, id interner,
//! unified cache, entity store, metadata index, and graph store together
//! and exposes the public ingest/query surface. There are no globals;
//! tests instantiate as many engines as they like.
//!
//! Write control flow: persist the entity records, extract and index the
//! metadata, bump counts, and let dirty structures drain through the
//! write buffer on `flush`. Query control flow: parse the predicate,
//! order conjuncts by selectivity, resolve each through the sparse index
//! → chunks → bitmaps, combine, and convert the final bitmap to UUIDs.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::UnifiedCache;
use crate::config::EngineConfig;
use crate::entities::{EntityCounts, EntityError, EntityStore};
use crate::graph::{GraphError, GraphStore};
use crate::index::{HealthReport, IndexError, IndexStats, MetadataIndex};
use crate::interner::{IdMapper, InternerError};
use crate::model::{Metadata, Noun, Verb};
use crate::storage::{ObjectStore, StorageError};
use crate::writebuf::WriteBuffer;

/// Listing batch used during rebuild against cloud backends; local
/// backends page the whole table at once.
const CLOUD_REBUILD_BATCH: usize = 25;
const LOCAL_REBUILD_BATCH: usize = 10_000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Interner(#[from] InternerError),
    #[error(
        "metadata index is corrupt ({avg_entries_per_entity:.1} avg entries/entity); \
         auto-repair is disabled, run rebuild"
    )]
    CorruptIndex { avg_entries_per_entity: f64 },
}

/// Aggregate engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub counts: EntityCounts,
    pub index: IndexStats,
    pub cached_index_objects: usize,
    pub buffered_writes: u64,
}

pub struct Engine {
    store: Arc<dyn ObjectStore>,
    writer: Arc<WriteBuffer>,
    cache: Arc<UnifiedCache>,
    entities: Arc<EntityStore>,
    index: MetadataIndex,
    graph: GraphStore,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Open an engine over a backend, loading persisted state (id mapper,
    /// counts, field registry, statistics) and running the startup health
    /// check. A corrupt index triggers an automatic rebuild when
    /// `config.auto_repair` is set.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let writer = Arc::new(WriteBuffer::new(
            Arc::clone(&store),
            config.write_buffer.clone(),
        ));
        let interner = Arc::new(Mutex::new(IdMapper::load(store.as_ref()).await?));
        let cache = Arc::new(UnifiedCache::new(config.cache_budget_bytes));

        let entities = Arc::new(EntityStore::new(Arc::clone(&store), Arc::clone(&writer)));
        entities.init().await?;

        let index = MetadataIndex::new(
            Arc::clone(&store),
            Arc::clone(&writer),
            interner,
            Arc::clone(&cache),
            config.index.clone(),
        );
        index.init().await?;

        let graph = GraphStore::new(Arc::clone(&store));
        let engine = Self {
            store,
            writer,
            cache,
            entities,
            index,
            graph,
        };

        let report = engine.index.health_check().await;
        if report.corrupt {
            if config.auto_repair {
                tracing::warn!(
                    avg = report.avg_entries_per_entity,
                    "corrupt index detected at startup; rebuilding"
                );
                engine.rebuild().await?;
            } else {
                // Fail closed: a flagged-corrupt index must not serve
                // queries when repair is disabled.
                tracing::error!(
                    avg = report.avg_entries_per_entity,
                    "corrupt index detected; auto-repair disabled, refusing to open"
                );
                return Err(EngineError::CorruptIndex {
                    avg_entries_per_entity: report.avg_entries_per_entity,
                });
            }
        }
        tracing::info!("engine open");
        Ok(engine)
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    // ===== Ingest =====

    /// Create or update a noun: entity records, index postings, counts.
    pub async fn put_noun(&self, noun: &Noun) -> Result<(), EngineError> {
        // Read the previous metadata before the records are overwritten;
        // the index applies adds/removes as a diff.
        let previous = self.entities.load_noun_metadata(&noun.id).await?;
        self.entities.save_noun(noun).await?;

        let indexable = indexable_noun_metadata(noun);
        match previous {
            None => {
                self.index
                    .add_entity(noun.id, noun.noun_type.as_str(), &indexable)
                    .await?;
            }
            Some((old_type, old_metadata)) => {
                let old_indexable = with_type_key(&old_type, &old_metadata);
                self.index
                    .update_entity(noun.id, noun.noun_type.as_str(), &old_indexable, &indexable)
                    .await?;
            }
        }
        Ok(())
    }

    /// Rewrite a noun's metadata without touching its vector, applying
    /// index adds/removes as a diff.
    pub async fn update_noun_metadata(
        &self,
        id: Uuid,
        metadata: Metadata,
    ) -> Result<(), EngineError> {
        let Some((type_name, old_metadata)) = self.entities.load_noun_metadata(&id).await? else {
            return Err(EngineError::Storage(StorageError::NotFound {
                path: crate::storage::keys::noun_metadata(&id),
            }));
        };
        let noun_type = crate::model::NounType::from_name(&type_name);
        self.entities
            .save_noun_metadata(id, noun_type, &metadata)
            .await?;
        let old_indexable = with_type_key(&type_name, &old_metadata);
        let new_indexable = with_type_key(&type_name, &metadata);
        self.index
            .update_entity(id, &type_name, &old_indexable, &new_indexable)
            .await?;
        Ok(())
    }

    /// Delete a noun. Providing the entity's metadata makes the index
    /// removal symmetric and cheap; without it the engine falls back to
    /// reading the stored record, and if that is gone too, to a full
    /// index scan (documented slow path).
    pub async fn delete_noun(
        &self,
        id: Uuid,
        known_metadata: Option<(String, Metadata)>,
    ) -> Result<(), EngineError> {
        let stored = match known_metadata {
            Some(known) => Some(known),
            None => self.entities.load_noun_metadata(&id).await?,
        };
        match stored {
            Some((type_name, metadata)) => {
                let indexable = with_type_key(&type_name, &metadata);
                self.index.remove_entity(id, &type_name, &indexable).await?;
                self.entities.delete_noun(&id, &type_name).await?;
            }
            None => {
                self.index.remove_entity_by_scan(id).await?;
                self.entities.delete_noun(&id, "").await?;
            }
        }
        self.graph.delete_node(&id).await?;
        Ok(())
    }

    /// Create or update a verb. Core fields (type, source, target) are
    /// indexed alongside metadata so relationships are queryable by
    /// endpoint.
    pub async fn put_verb(&self, verb: &Verb) -> Result<(), EngineError> {
        let previous = self.entities.load_verb(&verb.id).await?;
        self.entities.save_verb(verb).await?;

        let indexable = indexable_verb_metadata(verb);
        match previous {
            None => {
                self.index
                    .add_entity(verb.id, verb.verb_type.as_str(), &indexable)
                    .await?;
            }
            Some(old) => {
                let old_indexable = indexable_verb_metadata(&old);
                self.index
                    .update_entity(verb.id, verb.verb_type.as_str(), &old_indexable, &indexable)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn delete_verb(&self, id: Uuid) -> Result<(), EngineError> {
        match self.entities.load_verb(&id).await? {
            Some(verb) => {
                let indexable = indexable_verb_metadata(&verb);
                self.index
                    .remove_entity(id, verb.verb_type.as_str(), &indexable)
                    .await?;
                self.entities
                    .delete_verb(&id, verb.verb_type.as_str())
                    .await?;
            }
            None => {
                self.index.remove_entity_by_scan(id).await?;
                self.entities.delete_verb(&id, "").await?;
            }
        }
        Ok(())
    }

    // ===== Read =====

    pub async fn get_noun(&self, id: &Uuid) -> Result<Option<Noun>, EngineError> {
        Ok(self.entities.load_noun(id).await?)
    }

    pub async fn get_verb(&self, id: &Uuid) -> Result<Option<Verb>, EngineError> {
        Ok(self.entities.load_verb(id).await?)
    }

    /// Evaluate a JSON predicate to matching entity ids.
    pub async fn query(&self, predicate: &Value) -> Result<Vec<Uuid>, EngineError> {
        Ok(self.index.query(predicate, self.entities.as_ref()).await?)
    }

    /// Filtered, ordered, paginated ids. Pagination happens before any
    /// entity record is loaded.
    pub async fn query_sorted(
        &self,
        predicate: &Value,
        order_by: &str,
        descending: bool,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Uuid>, EngineError> {
        Ok(self
            .index
            .query_sorted(
                predicate,
                order_by,
                descending,
                offset,
                limit,
                self.entities.as_ref(),
            )
            .await?)
    }

    // ===== Maintenance =====

    /// Drain everything dirty: counts, chunks, sparse indices, registry,
    /// statistics, the id mapper, and the coalescing buffer.
    pub async fn flush(&self) -> Result<(), EngineError> {
        self.entities.flush().await?;
        self.index.flush().await?;
        Ok(())
    }

    pub async fn health_check(&self) -> HealthReport {
        self.index.health_check().await
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            counts: self.entities.counts().await,
            index: self.index.stats().await,
            cached_index_objects: self.cache.len(),
            buffered_writes: self.writer.flushed_writes(),
        }
    }

    /// Clear every index structure and re-ingest all entities via a
    /// paginated scan. Idempotent: running it twice yields identical chunk
    /// and sparse-index contents.
    pub async fn rebuild(&self) -> Result<u64, EngineError> {
        tracing::info!("rebuild started");
        self.index.clear_all().await?;
        self.entities.clear_caches().await;

        let batch = if self.store.is_cloud_storage() {
            CLOUD_REBUILD_BATCH
        } else {
            LOCAL_REBUILD_BATCH
        };

        let mut reindexed = 0u64;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .entities
                .list_nouns(None, cursor.as_deref(), batch)
                .await?;
            for (id, type_name, metadata) in page.items {
                let indexable = with_type_key(&type_name, &metadata);
                self.index.add_entity(id, &type_name, &indexable).await?;
                reindexed += 1;
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let mut cursor: Option<String> = None;
        loop {
            let page = self.entities.list_verbs(cursor.as_deref(), batch).await?;
            for (id, type_name, source, target, metadata) in page.items {
                let indexable = verb_indexable_parts(&type_name, source, target, &metadata);
                self.index.add_entity(id, &type_name, &indexable).await?;
                reindexed += 1;
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        self.flush().await?;
        tracing::info!(entities = reindexed, "rebuild complete");
        Ok(reindexed)
    }
}

/// The extraction view of a noun: its metadata plus the `type` key the
/// index maps to the stable `noun` field.
fn indexable_noun_metadata(noun: &Noun) -> Metadata {
    with_type_key(noun.noun_type.as_str(), &noun.metadata)
}

fn with_type_key(type_name: &str, metadata: &Metadata) -> Metadata {
    let mut out = metadata.clone();
    out.insert("type".to_string(), Value::String(type_name.to_string()));
    out
}

/// The extraction view of a verb: metadata plus type/source/target.
fn indexable_verb_metadata(verb: &Verb) -> Metadata {
    verb_indexable_parts(
        verb.verb_type.as_str(),
        verb.source,
        verb.target,
        &verb.metadata,
    )
}

fn verb_indexable_parts(
    type_name: &str,
    source: Uuid,
    target: Uuid,
    metadata: &Metadata,
) -> Metadata {
    let mut out = with_type_key(type_name, metadata);
    out.insert("source".to_string(), Value::String(source.to_string()));
    out.insert("target".to_string(), Value::String(target.to_string()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NounType, VerbType};
    use crate::storage::MemoryStore;
    use serde_json::json;

    async fn test_engine() -> Engine {
        Engine::open(Arc::new(MemoryStore::new()), EngineConfig::default())
            .await
            .unwrap()
    }

    fn meta(value: Value) -> Metadata {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_put_noun_then_query_by_type() {
        let engine = test_engine().await;
        let noun = Noun::new(NounType::Concept, vec![0.1, 0.2])
            .with_metadata(meta(json!({"score": 0.9})));
        engine.put_noun(&noun).await.unwrap();

        let hits = engine.query(&json!({"noun": "Concept"})).await.unwrap();
        assert_eq!(hits, vec![noun.id]);
    }

    #[tokio::test]
    async fn test_put_noun_twice_diffs_index() {
        let engine = test_engine().await;
        let mut noun = Noun::new(NounType::Thing, vec![0.1])
            .with_metadata(meta(json!({"status": "draft"})));
        engine.put_noun(&noun).await.unwrap();

        noun.metadata = meta(json!({"status": "final"}));
        engine.put_noun(&noun).await.unwrap();

        assert!(engine
            .query(&json!({"status": "draft"}))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            engine.query(&json!({"status": "final"})).await.unwrap(),
            vec![noun.id]
        );
        assert_eq!(engine.stats().await.counts.total_nouns, 1);
    }

    #[tokio::test]
    async fn test_delete_noun_without_metadata_uses_stored_record() {
        let engine = test_engine().await;
        let noun = Noun::new(NounType::Person, vec![0.3])
            .with_metadata(meta(json!({"name": "ada"})));
        engine.put_noun(&noun).await.unwrap();
        engine.delete_noun(noun.id, None).await.unwrap();

        assert!(engine.query(&json!({"name": "ada"})).await.unwrap().is_empty());
        assert!(engine.get_noun(&noun.id).await.unwrap().is_none());
        assert_eq!(engine.stats().await.counts.total_nouns, 0);
    }

    #[tokio::test]
    async fn test_verb_endpoints_are_queryable() {
        let engine = test_engine().await;
        let source = Uuid::new_v4();
        let target = Uuid::new_v4();
        let verb = Verb::new(VerbType::Knows, source, target, vec![0.1]);
        engine.put_verb(&verb).await.unwrap();

        let hits = engine
            .query(&json!({"source": source.to_string()}))
            .await
            .unwrap();
        assert_eq!(hits, vec![verb.id]);
        let hits = engine.query(&json!({"noun": "knows"})).await.unwrap();
        assert_eq!(hits, vec![verb.id]);
    }

    #[tokio::test]
    async fn test_query_sorted_paginates() {
        let engine = test_engine().await;
        let mut ids = Vec::new();
        for i in 0..10 {
            let noun = Noun::new(NounType::Metric, vec![0.1])
                .with_metadata(meta(json!({"rank": i})));
            ids.push(noun.id);
            engine.put_noun(&noun).await.unwrap();
        }

        let page = engine
            .query_sorted(&json!({"noun": "Metric"}), "rank", true, 2, 3)
            .await
            .unwrap();
        assert_eq!(page, vec![ids[7], ids[6], ids[5]]);
    }

    #[tokio::test]
    async fn test_flush_then_reopen_preserves_queries() {
        let store = Arc::new(MemoryStore::new());
        let noun_id;
        {
            let engine = Engine::open(store.clone(), EngineConfig::default())
                .await
                .unwrap();
            let noun = Noun::new(NounType::Concept, vec![0.5])
                .with_metadata(meta(json!({"score": 0.73})));
            noun_id = noun.id;
            engine.put_noun(&noun).await.unwrap();
            engine.flush().await.unwrap();
        }

        let reopened = Engine::open(store, EngineConfig::default()).await.unwrap();
        let hits = reopened.query(&json!({"score": 0.73})).await.unwrap();
        assert_eq!(hits, vec![noun_id]);
        assert_eq!(reopened.stats().await.counts.total_nouns, 1);
    }

    #[tokio::test]
    async fn test_open_fails_closed_on_corrupt_index_without_auto_repair() {
        use crate::index::IndexStats;
        use crate::storage::{keys, ObjectStore};

        let store = Arc::new(MemoryStore::new());
        // Seed a statistics record exhibiting the entry-leak pattern the
        // health check guards against.
        let stats = IndexStats {
            entity_count: 10,
            total_index_entries: 5_000,
            ..IndexStats::default()
        };
        store
            .put(keys::STATISTICS, serde_json::to_vec(&stats).unwrap())
            .await
            .unwrap();

        let config = EngineConfig {
            auto_repair: false,
            ..EngineConfig::default()
        };
        let err = Engine::open(store, config).await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptIndex { .. }));
    }

    #[tokio::test]
    async fn test_open_auto_repairs_corrupt_index() {
        use crate::index::IndexStats;
        use crate::storage::{keys, ObjectStore};

        let store = Arc::new(MemoryStore::new());
        let stats = IndexStats {
            entity_count: 10,
            total_index_entries: 5_000,
            ..IndexStats::default()
        };
        store
            .put(keys::STATISTICS, serde_json::to_vec(&stats).unwrap())
            .await
            .unwrap();

        // Default config repairs: the rebuild resets statistics and the
        // engine opens healthy.
        let engine = Engine::open(store, EngineConfig::default()).await.unwrap();
        assert!(!engine.health_check().await.corrupt);
    }

    #[tokio::test]
    async fn test_rebuild_restores_queryability() {
        let engine = test_engine().await;
        let noun = Noun::new(NounType::Concept, vec![0.1])
            .with_metadata(meta(json!({"score": 0.5})));
        engine.put_noun(&noun).await.unwrap();
        engine.flush().await.unwrap();

        let reindexed = engine.rebuild().await.unwrap();
        assert_eq!(reindexed, 1);
        let hits = engine.query(&json!({"score": 0.5})).await.unwrap();
        assert_eq!(hits, vec![noun.id]);
    }
}
