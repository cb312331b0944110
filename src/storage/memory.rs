//! In-memory object store: tests, ephemeral engines, and the reference
//! implementation of the precondition semantics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::RwLock;

use super::{ObjectStore, PutOptions, StorageError};

struct Entry {
    bytes: Vec<u8>,
    etag: String,
}

/// In-memory backend. ETags are monotone version counters, so every write
/// to a key produces a distinct token and `if_match` detects interleaved
/// writers exactly.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys. Test convenience.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn next_etag(&self) -> String {
        format!("v{}", self.version.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_opts(
        &self,
        path: &str,
        bytes: Vec<u8>,
        opts: PutOptions,
    ) -> Result<String, StorageError> {
        if path.is_empty() {
            return Err(StorageError::InvalidArgument("empty key".to_string()));
        }
        let mut entries = self.entries.write().await;
        let current = entries.get(path);

        if let Some(expected) = &opts.if_match {
            match current {
                Some(entry) if entry.etag == *expected => {}
                _ => {
                    return Err(StorageError::PreconditionFailed {
                        path: path.to_string(),
                    })
                }
            }
        }
        if let Some(none_match) = &opts.if_none_match {
            let violated = match current {
                Some(entry) => none_match == "*" || entry.etag == *none_match,
                None => false,
            };
            if violated {
                return Err(StorageError::PreconditionFailed {
                    path: path.to_string(),
                });
            }
        }

        let etag = self.next_etag();
        entries.insert(
            path.to_string(),
            Entry {
                bytes,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn get_with_etag(&self, path: &str) -> Result<(Vec<u8>, String), StorageError> {
        let entries = self.entries.read().await;
        entries
            .get(path)
            .map(|e| (e.bytes.clone(), e.etag.clone()))
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> BoxStream<'_, Result<String, StorageError>> {
        let prefix = prefix.to_string();
        Box::pin(
            futures::stream::once(async move {
                let entries = self.entries.read().await;
                let keys: Vec<String> = entries
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, _)| k.clone())
                    .collect();
                futures::stream::iter(keys.into_iter().map(Ok))
            })
            .flatten(),
        )
    }
}
