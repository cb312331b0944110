//! # axondb - Embeddable Graph-and-Vector Store
//!
//! Typed entities ("nouns") and typed relationships ("verbs"), each with
//! an embedding vector and structured metadata, over a pluggable object
//! store. The core is a metadata-indexing engine that answers predicate
//! queries in sub-linear time: an inverted index from (field, value) to
//! entity ids, organized as adaptively chunked sparse indices with zone
//! maps and Bloom filters over compressed bitmaps.
//!
//! ## Features
//!
//! - **Predicate queries**: equality, ranges, set membership, existence,
//!   text containment, and boolean combinations, planned by selectivity
//! - **Pluggable storage**: in-memory, local filesystem, or any backend
//!   implementing the [`storage::ObjectStore`] port; cloud backends get
//!   write coalescing, batching, and adaptive backpressure for free
//! - **Proximity-graph persistence**: HNSW node records with optimistic
//!   concurrency for concurrent mutual linking
//! - **Crash-safe maintenance**: startup health check with automatic
//!   index rebuild from entity records
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use axondb::{Engine, EngineConfig, Noun, NounType};
//! use axondb::storage::MemoryStore;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), axondb::EngineError> {
//! let engine = Engine::open(Arc::new(MemoryStore::new()), EngineConfig::default()).await?;
//!
//! let noun = Noun::new(NounType::Concept, vec![0.1, 0.2, 0.3])
//!     .with_metadata(serde_json::from_value(json!({"score": 0.73})).unwrap());
//! engine.put_noun(&noun).await?;
//! engine.flush().await?;
//!
//! let hits = engine.query(&json!({"noun": "Concept", "score": {"gte": 0.5}})).await?;
//! assert_eq!(hits, vec![noun.id]);
//! # Ok(())
//! # }
//! ```

// Public library API modules
pub mod bitmap;
pub mod cache;
pub mod config;
pub mod engine;
pub mod entities;
pub mod graph;
pub mod index;
pub mod interner;
pub mod model;
pub mod storage;
pub mod writebuf;

pub use bitmap::IdSet;
pub use config::EngineConfig;
pub use engine::{Engine, EngineError, EngineStats};
pub use entities::{EntityCounts, EntityStore};
pub use graph::{GraphRecord, GraphStore, GraphSystem};
pub use index::predicate::Predicate;
pub use index::{HealthReport, IndexStats, MetadataIndex};
pub use interner::IdMapper;
pub use model::{Metadata, Noun, NounType, Verb, VerbType};
pub use storage::{LocalStore, MemoryStore, ObjectStore, StorageError};
pub use writebuf::{WriteBuffer, WriteBufferConfig};
