//! Engine-over-local-filesystem tests: the same behaviors the in-memory
//! tests cover must hold when records live on disk.

mod common;

use std::sync::Arc;

use common::{init_tracing, noun_with};

use axondb::storage::LocalStore;
use axondb::{Engine, EngineConfig, NounType};
use serde_json::json;

#[tokio::test]
async fn test_disk_round_trip_across_reopen() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::TempDir::new()?;
    let noun = noun_with(NounType::Concept, json!({"score": 0.73, "name": "persisted"}));

    {
        let store = Arc::new(LocalStore::open(dir.path())?);
        let engine = Engine::open(store, EngineConfig::default()).await?;
        engine.put_noun(&noun).await?;
        engine.flush().await?;
    }

    let store = Arc::new(LocalStore::open(dir.path())?);
    let engine = Engine::open(store, EngineConfig::default()).await?;

    let loaded = engine.get_noun(&noun.id).await?.expect("noun on disk");
    assert_eq!(loaded.metadata, noun.metadata);
    assert_eq!(loaded.vector, noun.vector);

    let hits = engine.query(&json!({"score": {"gte": 0.5}})).await?;
    assert_eq!(hits, vec![noun.id]);
    assert_eq!(engine.stats().await.counts.total_nouns, 1);
    Ok(())
}

#[tokio::test]
async fn test_disk_layout_matches_wire_contract() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::TempDir::new()?;
    let store = Arc::new(LocalStore::open(dir.path())?);
    let engine = Engine::open(store, EngineConfig::default()).await?;

    let noun = noun_with(NounType::Thing, json!({"a": 1}));
    engine.put_noun(&noun).await?;
    engine.flush().await?;

    let shard = &noun.id.simple().to_string()[..2];
    let vector_path = dir
        .path()
        .join(format!("entities/nouns/vectors/{shard}/{}.json", noun.id));
    let metadata_path = dir
        .path()
        .join(format!("entities/nouns/metadata/{shard}/{}.json", noun.id));
    assert!(vector_path.exists(), "missing {}", vector_path.display());
    assert!(metadata_path.exists(), "missing {}", metadata_path.display());
    assert!(dir.path().join("_system/counts.json").exists());
    assert!(dir.path().join("__entity_id_mapper__").exists());
    Ok(())
}

#[tokio::test]
async fn test_delete_on_disk_is_complete() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::TempDir::new()?;
    let store = Arc::new(LocalStore::open(dir.path())?);
    let engine = Engine::open(store, EngineConfig::default()).await?;

    let noun = noun_with(NounType::Person, json!({"name": "grace"}));
    engine.put_noun(&noun).await?;
    engine.flush().await?;

    engine.delete_noun(noun.id, None).await?;
    engine.flush().await?;

    assert!(engine.get_noun(&noun.id).await?.is_none());
    assert!(engine.query(&json!({"name": "grace"})).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rebuild_on_disk() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::TempDir::new()?;
    let store = Arc::new(LocalStore::open(dir.path())?);
    let engine = Engine::open(store, EngineConfig::default()).await?;

    for i in 0..20 {
        let noun = noun_with(NounType::Metric, json!({"value": i}));
        engine.put_noun(&noun).await?;
    }
    engine.flush().await?;

    let reindexed = engine.rebuild().await?;
    assert_eq!(reindexed, 20);
    let hits = engine.query(&json!({"value": {"lt": 5}})).await?;
    assert_eq!(hits.len(), 5);
    Ok(())
}
