//! Graph persistence and concurrency tests.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{memory_engine, noun_with};

use axondb::{GraphRecord, NounType};
use uuid::Uuid;

#[tokio::test]
async fn test_ten_concurrent_inserters_link_a_shared_hub() {
    let engine = Arc::new(memory_engine().await);

    let hub = noun_with(NounType::Concept, serde_json::json!({"role": "hub"}));
    engine.put_noun(&hub).await.unwrap();
    engine
        .graph()
        .save_node(&GraphRecord::new(hub.id, 0))
        .await
        .unwrap();

    let mut handles = Vec::new();
    let mut inserter_ids = Vec::new();
    for i in 0..10 {
        let engine = Arc::clone(&engine);
        let hub_id = hub.id;
        let noun = noun_with(NounType::Concept, serde_json::json!({"rank": i}));
        inserter_ids.push(noun.id);
        handles.push(tokio::spawn(async move {
            engine.put_noun(&noun).await.unwrap();
            engine.graph().link(noun.id, hub_id, 0).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // After quiescence the hub's level-0 neighbor set holds all ten
    // inserters: no concurrent edit was lost.
    let hub_record = engine.graph().load_node(&hub.id).await.unwrap().unwrap();
    let neighbors: BTreeSet<Uuid> = hub_record.neighbors_at(0).copied().collect();
    assert_eq!(neighbors.len(), 10);
    for id in &inserter_ids {
        assert!(neighbors.contains(id), "hub lost edge to {id}");
    }
}

#[tokio::test]
async fn test_concurrent_rmw_union_equals_all_edits() {
    let engine = Arc::new(memory_engine().await);
    let node = Uuid::new_v4();

    let mut handles = Vec::new();
    let mut expected = BTreeSet::new();
    for level in 0..3u8 {
        for _ in 0..5 {
            let neighbor = Uuid::new_v4();
            expected.insert((level, neighbor));
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .graph()
                    .update_node(node, 2, |record| {
                        record.add_neighbor(level, neighbor);
                    })
                    .await
                    .unwrap();
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let record = engine.graph().load_node(&node).await.unwrap().unwrap();
    let actual: BTreeSet<(u8, Uuid)> = record
        .neighbors
        .iter()
        .flat_map(|(level, set)| set.iter().map(|n| (*level, *n)))
        .collect();
    assert_eq!(actual, expected, "final record must be the union of edits");
}

#[tokio::test]
async fn test_entry_point_record_tracks_max_level() {
    let engine = memory_engine().await;
    let entry = Uuid::new_v4();

    engine
        .graph()
        .update_system(|system| {
            if system.max_level < 5 {
                system.entry_point_id = Some(entry);
                system.max_level = 5;
            }
        })
        .await
        .unwrap();

    let system = engine.graph().load_system().await.unwrap();
    assert_eq!(system.entry_point_id, Some(entry));
    assert_eq!(system.max_level, 5);
}

#[tokio::test]
async fn test_graph_record_gone_after_entity_delete() {
    let engine = memory_engine().await;
    let noun = noun_with(NounType::Concept, serde_json::json!({"x": 1}));
    engine.put_noun(&noun).await.unwrap();
    engine
        .graph()
        .save_node(&GraphRecord::new(noun.id, 1))
        .await
        .unwrap();

    engine.delete_noun(noun.id, None).await.unwrap();
    assert!(engine.graph().load_node(&noun.id).await.unwrap().is_none());
}
