//! Object-store port: a primitive async key/value interface over a flat,
//! `/`-separated key space.
//!
//! Everything the engine persists goes through [`ObjectStore`] - entity
//! records, index chunks, sparse indices, the id mapper, system records.
//! One implementation per backend: [`MemoryStore`] for tests and ephemeral
//! engines, [`LocalStore`] for on-disk databases. Cloud blob backends plug
//! in behind the same trait; they set [`ObjectStore::is_cloud_storage`] so
//! the write layer routes them through the coalescing buffer.
//!
//! ## Module structure
//!
//! - `keys` - the wire-stable key layout (see the constants' docs)
//! - `memory` - in-memory backend with full precondition support
//! - `local` - local-FS backend with atomic temp-file-then-rename writes

mod local;
mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

/// Boundary error taxonomy. Callers distinguish absent (`NotFound`) from
/// transient (`Throttled`) from concurrent-writer (`PreconditionFailed`)
/// failures; the propagation policy for each kind lives with the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("precondition failed for {path}")]
    PreconditionFailed { path: String },
    #[error("throttled by backend")]
    Throttled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corrupted record at {path}: {reason}")]
    Corrupted { path: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, StorageError::Throttled)
    }
}

/// Optimistic-concurrency preconditions for [`ObjectStore::put_opts`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Write only if the current ETag equals this token.
    pub if_match: Option<String>,
    /// Write only if the key does not exist (`Some("*")`) or does not
    /// carry this ETag.
    pub if_none_match: Option<String>,
}

impl PutOptions {
    pub fn if_match(etag: impl Into<String>) -> Self {
        Self {
            if_match: Some(etag.into()),
            if_none_match: None,
        }
    }

    pub fn if_absent() -> Self {
        Self {
            if_match: None,
            if_none_match: Some("*".to_string()),
        }
    }
}

/// Options for [`ObjectStore::batch_delete`].
#[derive(Debug, Clone)]
pub struct BatchDeleteOptions {
    pub max_retries: u32,
    pub continue_on_error: bool,
}

impl Default for BatchDeleteOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            continue_on_error: true,
        }
    }
}

/// Concurrency bound for the provided batch operations.
const BATCH_CONCURRENCY: usize = 16;

/// Primitive async operations over a flat `path → bytes` namespace.
///
/// All mutations are atomic per key. `delete` is idempotent. Paths use `/`
/// separators and are prefix-structured; see [`keys`].
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Unconditional atomic write.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.put_opts(path, bytes, PutOptions::default()).await?;
        Ok(())
    }

    /// Atomic write with optional optimistic preconditions. Returns the new
    /// ETag of the key.
    async fn put_opts(
        &self,
        path: &str,
        bytes: Vec<u8>,
        opts: PutOptions,
    ) -> Result<String, StorageError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        Ok(self.get_with_etag(path).await?.0)
    }

    /// Read bytes plus the precondition token for read-modify-write.
    async fn get_with_etag(&self, path: &str) -> Result<(Vec<u8>, String), StorageError>;

    /// Read, mapping absence to `None` instead of an error.
    async fn get_opt(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Idempotent delete: removing an absent key succeeds.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// All keys under a prefix, as a finite stream.
    fn list(&self, prefix: &str) -> BoxStream<'_, Result<String, StorageError>>;

    /// Whether writes should be routed through the coalescing buffer.
    /// Cloud blob backends answer true; local and in-memory backends are
    /// latency-cheap and bypass it.
    fn is_cloud_storage(&self) -> bool {
        false
    }

    /// Delete many keys with bounded concurrency and per-key retries.
    async fn batch_delete(
        &self,
        paths: &[String],
        opts: BatchDeleteOptions,
    ) -> Result<(), StorageError> {
        let max_retries = opts.max_retries;
        let results: Vec<Result<(), StorageError>> = futures::stream::iter(paths.to_vec())
            .map(|path| -> BoxFuture<'_, Result<(), StorageError>> {
                Box::pin(async move {
                    let mut attempt = 0u32;
                    loop {
                        match self.delete(&path).await {
                            Ok(()) => return Ok(()),
                            Err(e) if e.is_throttled() && attempt < max_retries => {
                                attempt += 1;
                                tokio::time::sleep(std::time::Duration::from_millis(
                                    50 * u64::from(attempt),
                                ))
                                .await;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                })
            })
            .buffer_unordered(BATCH_CONCURRENCY)
            .collect()
            .await;

        for result in results {
            if let Err(e) = result {
                if opts.continue_on_error {
                    tracing::warn!(error = %e, "batch delete entry failed, continuing");
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Read many keys with bounded concurrency. Missing paths are omitted
    /// from the result; other errors abort the batch.
    async fn batch_read(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, StorageError> {
        let results: Vec<Result<Option<(String, Vec<u8>)>, StorageError>> =
            futures::stream::iter(paths.to_vec())
                .map(|path| -> BoxFuture<'_, Result<Option<(String, Vec<u8>)>, StorageError>> {
                    Box::pin(async move {
                        match self.get(&path).await {
                            Ok(bytes) => Ok(Some((path.clone(), bytes))),
                            Err(e) if e.is_not_found() => Ok(None),
                            Err(e) => Err(e),
                        }
                    })
                })
                .buffer_unordered(BATCH_CONCURRENCY)
                .collect()
                .await;

        let mut map = HashMap::with_capacity(paths.len());
        for result in results {
            if let Some((path, bytes)) = result? {
                map.insert(path, bytes);
            }
        }
        Ok(map)
    }
}

/// Wire-stable key layout.
///
/// ```text
/// entities/nouns/vectors/<shard>/<uuid>.json     vector record
/// entities/nouns/metadata/<shard>/<uuid>.json    metadata record
/// entities/nouns/hnsw/<shard>/<uuid>.json        graph record (level + neighbors)
/// entities/verbs/vectors/<shard>/<uuid>.json     verb vector record (incl. source/target/type)
/// entities/verbs/metadata/<shard>/<uuid>.json
/// __sparse_index__<field>                        per-field routing directory
/// __metadata_field_index__field_<name>           per-field value→count directory
/// __metadata_field_registry__                    indexed-field list (fast cold start)
/// __entity_id_mapper__                           UUID↔int bijection
/// _system/counts.json                            aggregate counts
/// _system/hnsw-system.json                       { entry_point_id, max_level }
/// _system/statistics.json                        descriptive stats
/// ```
pub mod keys {
    use uuid::Uuid;

    pub const ID_MAPPER: &str = "__entity_id_mapper__";
    pub const FIELD_REGISTRY: &str = "__metadata_field_registry__";
    pub const COUNTS: &str = "_system/counts.json";
    pub const GRAPH_SYSTEM: &str = "_system/hnsw-system.json";
    pub const STATISTICS: &str = "_system/statistics.json";

    pub const NOUN_VECTOR_PREFIX: &str = "entities/nouns/vectors/";
    pub const NOUN_METADATA_PREFIX: &str = "entities/nouns/metadata/";
    pub const NOUN_GRAPH_PREFIX: &str = "entities/nouns/hnsw/";
    pub const VERB_VECTOR_PREFIX: &str = "entities/verbs/vectors/";
    pub const VERB_METADATA_PREFIX: &str = "entities/verbs/metadata/";

    pub const SPARSE_INDEX_PREFIX: &str = "__sparse_index__";
    pub const FIELD_INDEX_PREFIX: &str = "__metadata_field_index__field_";

    /// First two lowercase hex characters of the UUID: 256 buckets, bounds
    /// per-prefix key counts so `list` stays cheap.
    pub fn shard(id: &Uuid) -> String {
        let simple = id.simple().to_string();
        simple[..2].to_string()
    }

    pub fn noun_vector(id: &Uuid) -> String {
        format!("{}{}/{id}.json", NOUN_VECTOR_PREFIX, shard(id))
    }

    pub fn noun_metadata(id: &Uuid) -> String {
        format!("{}{}/{id}.json", NOUN_METADATA_PREFIX, shard(id))
    }

    pub fn noun_graph(id: &Uuid) -> String {
        format!("{}{}/{id}.json", NOUN_GRAPH_PREFIX, shard(id))
    }

    pub fn verb_vector(id: &Uuid) -> String {
        format!("{}{}/{id}.json", VERB_VECTOR_PREFIX, shard(id))
    }

    pub fn verb_metadata(id: &Uuid) -> String {
        format!("{}{}/{id}.json", VERB_METADATA_PREFIX, shard(id))
    }

    pub fn sparse_index(field: &str) -> String {
        format!("{SPARSE_INDEX_PREFIX}{}", sanitize_field(field))
    }

    pub fn field_index(field: &str) -> String {
        format!("{FIELD_INDEX_PREFIX}{}", sanitize_field(field))
    }

    pub fn chunk(field: &str, chunk_id: u32) -> String {
        format!("{FIELD_INDEX_PREFIX}{}__chunk_{chunk_id}", sanitize_field(field))
    }

    /// Field names become key components, so they must stay filesystem-safe.
    /// Anything outside `[A-Za-z0-9_.-]` is replaced with `-`.
    pub fn sanitize_field(field: &str) -> String {
        field
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_shard_is_two_lowercase_hex_chars() {
            let id = Uuid::parse_str("AB3F0000-0000-4000-8000-000000000000").unwrap();
            assert_eq!(shard(&id), "ab");
        }

        #[test]
        fn test_entity_keys_are_shard_routed() {
            let id = Uuid::parse_str("ab3f0000-0000-4000-8000-000000000000").unwrap();
            assert_eq!(
                noun_vector(&id),
                format!("entities/nouns/vectors/ab/{id}.json")
            );
            assert_eq!(
                verb_metadata(&id),
                format!("entities/verbs/metadata/ab/{id}.json")
            );
        }

        #[test]
        fn test_sanitize_field_replaces_unsafe_chars() {
            assert_eq!(sanitize_field("user/name value"), "user-name-value");
            assert_eq!(sanitize_field("createdAt"), "createdAt");
        }
    }
}
