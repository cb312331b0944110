//! Rebuild and health-check tests.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{memory_engine, noun_with};

use axondb::storage::{MemoryStore, ObjectStore};
use axondb::{Engine, EngineConfig, NounType};
use futures::TryStreamExt;
use serde_json::json;

/// Snapshot every persisted index object (chunks, sparse indices, value
/// counts, registry, id mapper) as bytes.
async fn index_snapshot(store: &MemoryStore) -> BTreeMap<String, Vec<u8>> {
    let mut snapshot = BTreeMap::new();
    for prefix in ["__sparse_index__", "__metadata_field_index__", "__entity_id_mapper__", "__metadata_field_registry__"] {
        let keys: Vec<String> = store.list(prefix).try_collect().await.unwrap();
        for key in keys {
            snapshot.insert(key.clone(), store.get(&key).await.unwrap());
        }
    }
    snapshot
}

#[tokio::test]
async fn test_rebuild_is_idempotent_byte_for_byte() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::open(store.clone(), EngineConfig::default())
        .await
        .unwrap();
    for i in 0..50 {
        let noun = noun_with(
            NounType::Concept,
            json!({"rank": i, "group": format!("g{}", i % 5)}),
        );
        engine.put_noun(&noun).await.unwrap();
    }
    engine.flush().await.unwrap();

    engine.rebuild().await.unwrap();
    let first = index_snapshot(&store).await;

    engine.rebuild().await.unwrap();
    let second = index_snapshot(&store).await;

    assert_eq!(first.len(), second.len());
    for (key, bytes) in &first {
        assert_eq!(
            Some(bytes),
            second.get(key),
            "rebuild diverged at {key}"
        );
    }
}

#[tokio::test]
async fn test_rebuild_after_clear_restores_all_queries() {
    let engine = memory_engine().await;
    let mut ids = Vec::new();
    for i in 0..100 {
        let noun = noun_with(
            NounType::Metric,
            json!({"value": i, "parity": if i % 2 == 0 { "even" } else { "odd" }}),
        );
        ids.push(noun.id);
        engine.put_noun(&noun).await.unwrap();
    }
    engine.flush().await.unwrap();

    let reindexed = engine.rebuild().await.unwrap();
    assert_eq!(reindexed, 100);

    let hits = engine.query(&json!({"parity": "even"})).await.unwrap();
    assert_eq!(hits.len(), 50);
    let hits = engine
        .query(&json!({"value": {"between": [10, 19]}}))
        .await
        .unwrap();
    assert_eq!(hits.len(), 10);
}

#[tokio::test]
async fn test_average_entries_within_expected_band_after_rebuild() {
    let engine = memory_engine().await;
    // Well-formed 10k corpus: scalar fields, a short tag list, and two
    // sentences of string content per entity, so the expected entry count
    // per entity sits near 30 (fields + word tokens + presence).
    for i in 0..10_000 {
        let noun = noun_with(
            NounType::Document,
            json!({
                "title": format!("document number {i} on graph storage"),
                "description": format!(
                    "an indexed record describing storage layout and query planning for workload {}",
                    i % 97
                ),
                "rank": i,
                "team": format!("team-{}", i % 7),
                "active": i % 3 == 0,
                "tags": [format!("tag-{}", i % 11), "indexed"],
            }),
        );
        engine.put_noun(&noun).await.unwrap();
    }
    engine.flush().await.unwrap();
    engine.rebuild().await.unwrap();

    let report = engine.health_check().await;
    assert!(!report.corrupt);
    assert!(
        report.avg_entries_per_entity >= 20.0 && report.avg_entries_per_entity <= 50.0,
        "avg entries per entity out of band: {}",
        report.avg_entries_per_entity
    );
}

#[tokio::test]
async fn test_verbs_survive_rebuild() {
    use axondb::{Verb, VerbType};
    use uuid::Uuid;

    let engine = memory_engine().await;
    let source = Uuid::new_v4();
    let target = Uuid::new_v4();
    let verb = Verb::new(VerbType::Cites, source, target, vec![0.2, 0.4]);
    engine.put_verb(&verb).await.unwrap();
    engine.flush().await.unwrap();

    engine.rebuild().await.unwrap();
    let hits = engine
        .query(&json!({"target": target.to_string()}))
        .await
        .unwrap();
    assert_eq!(hits, vec![verb.id]);
}
