//! Shared test fixtures.
#![allow(dead_code)]

use std::sync::Arc;

use axondb::storage::MemoryStore;
use axondb::{Engine, EngineConfig, Metadata, Noun, NounType};
use serde_json::Value;

static INIT_TRACING: std::sync::Once = std::sync::Once::new();

/// Route engine logs through the test writer; `RUST_LOG` filters apply.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Engine over a fresh in-memory store with default config.
pub async fn memory_engine() -> Engine {
    init_tracing();
    Engine::open(Arc::new(MemoryStore::new()), EngineConfig::default())
        .await
        .expect("engine open")
}

pub fn meta(value: Value) -> Metadata {
    serde_json::from_value(value).expect("metadata object")
}

/// Noun with a small deterministic vector.
pub fn noun_with(noun_type: NounType, metadata: Value) -> Noun {
    Noun::new(noun_type, vec![0.1, 0.2, 0.3]).with_metadata(meta(metadata))
}
