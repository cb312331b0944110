//! Proximity-graph (HNSW) persistence.
//!
//! Each graph node's `{level, per-level neighbor sets}` lives in its own
//! record, separate from the node's vector, so graph rewiring during index
//! build never rewrites vector payloads. The graph-wide entry point and
//! maximum level live in a single `_system/` record.
//!
//! Concurrent inserts routinely touch the *same* neighbor record (mutual
//! linking), so every mutation goes through read-modify-write under
//! optimistic concurrency: read with an ETag, edit locally, write with
//! `if_match`, and retry with exponential backoff on precondition failure.
//! Within one process a per-key async mutex additionally serializes the
//! cycle even on backends with real ETags, which keeps retry storms from
//! forming under local contention. Backends without ETag support get their
//! whole contract from that mutex (single-writer backends only).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rand::RngExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::{keys, ObjectStore, PutOptions, StorageError};

/// RMW retry policy: 50 ms × 2ⁿ, five attempts, then surface `Conflict`.
const MAX_RMW_ATTEMPTS: u32 = 5;
const RMW_BACKOFF_BASE_MS: u64 = 50;

/// Sweep the per-key lock registry once it grows past this many entries.
const LOCK_SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("write conflict on {path} after {attempts} attempts")]
    Conflict { path: String, attempts: u32 },
    #[error("graph record corrupted at {path}: {reason}")]
    Corrupted { path: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persisted placement of one node in the proximity graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub id: Uuid,
    pub level: u8,
    /// level → neighbor ids. Stored as id-valued sets; traversal resolves
    /// ids through the entity store, never through owning pointers.
    #[serde(default)]
    pub neighbors: BTreeMap<u8, BTreeSet<Uuid>>,
}

impl GraphRecord {
    pub fn new(id: Uuid, level: u8) -> Self {
        Self {
            id,
            level,
            neighbors: BTreeMap::new(),
        }
    }

    pub fn add_neighbor(&mut self, level: u8, neighbor: Uuid) -> bool {
        self.neighbors.entry(level).or_default().insert(neighbor)
    }

    pub fn remove_neighbor(&mut self, level: u8, neighbor: &Uuid) -> bool {
        let Some(set) = self.neighbors.get_mut(&level) else {
            return false;
        };
        let removed = set.remove(neighbor);
        if set.is_empty() {
            self.neighbors.remove(&level);
        }
        removed
    }

    pub fn neighbors_at(&self, level: u8) -> impl Iterator<Item = &Uuid> {
        self.neighbors.get(&level).into_iter().flatten()
    }
}

/// Graph-wide `{entry_point_id, max_level}` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSystem {
    pub entry_point_id: Option<Uuid>,
    pub max_level: u8,
}

/// Persistence for graph nodes and the entry-point record.
pub struct GraphStore {
    store: Arc<dyn ObjectStore>,
    key_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GraphStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            key_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn load_node(&self, id: &Uuid) -> Result<Option<GraphRecord>, GraphError> {
        let key = keys::noun_graph(id);
        match self.store.get(&key).await {
            Ok(bytes) => {
                let record =
                    serde_json::from_slice(&bytes).map_err(|e| GraphError::Corrupted {
                        path: key,
                        reason: e.to_string(),
                    })?;
                Ok(Some(record))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Unconditional write. Initial insertion of a fresh node only; shared
    /// records must go through [`GraphStore::update_node`].
    pub async fn save_node(&self, record: &GraphRecord) -> Result<(), GraphError> {
        let key = keys::noun_graph(&record.id);
        let bytes = serde_json::to_vec(record).map_err(|e| GraphError::Corrupted {
            path: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.put(&key, bytes).await?;
        Ok(())
    }

    pub async fn delete_node(&self, id: &Uuid) -> Result<(), GraphError> {
        self.store.delete(&keys::noun_graph(id)).await?;
        Ok(())
    }

    /// Read-modify-write a node record under optimistic concurrency. The
    /// edit closure may run several times (once per attempt); it must be
    /// pure over its captured inputs. A missing record starts from
    /// `GraphRecord::new(id, default_level)`.
    pub async fn update_node<F>(
        &self,
        id: Uuid,
        default_level: u8,
        mut edit: F,
    ) -> Result<GraphRecord, GraphError>
    where
        F: FnMut(&mut GraphRecord),
    {
        let key = keys::noun_graph(&id);
        self.read_modify_write(&key, move |bytes| {
            let mut record = match bytes {
                Some(bytes) => serde_json::from_slice(bytes).ok()?,
                None => GraphRecord::new(id, default_level),
            };
            edit(&mut record);
            Some(record)
        })
        .await
    }

    pub async fn load_system(&self) -> Result<GraphSystem, GraphError> {
        match self.store.get(keys::GRAPH_SYSTEM).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| GraphError::Corrupted {
                path: keys::GRAPH_SYSTEM.to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.is_not_found() => Ok(GraphSystem::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write the entry-point record, same discipline as node
    /// records.
    pub async fn update_system<F>(&self, mut edit: F) -> Result<GraphSystem, GraphError>
    where
        F: FnMut(&mut GraphSystem),
    {
        self.read_modify_write(keys::GRAPH_SYSTEM, move |bytes| {
            let mut system = match bytes {
                Some(bytes) => serde_json::from_slice(bytes).ok()?,
                None => GraphSystem::default(),
            };
            edit(&mut system);
            Some(system)
        })
        .await
    }

    /// Link two nodes bidirectionally at a level. Both sides go through
    /// the optimistic update path, so concurrent linkers against a shared
    /// hub never lose edits.
    pub async fn link(&self, a: Uuid, b: Uuid, level: u8) -> Result<(), GraphError> {
        self.update_node(a, level, |record| {
            record.add_neighbor(level, b);
        })
        .await?;
        self.update_node(b, level, |record| {
            record.add_neighbor(level, a);
        })
        .await?;
        Ok(())
    }

    pub async fn unlink(&self, a: Uuid, b: Uuid, level: u8) -> Result<(), GraphError> {
        self.update_node(a, level, |record| {
            record.remove_neighbor(level, &b);
        })
        .await?;
        self.update_node(b, level, |record| {
            record.remove_neighbor(level, &a);
        })
        .await?;
        Ok(())
    }

    /// The shared RMW loop: per-key mutex, ETag precondition, bounded
    /// jittered backoff. `apply` returns `None` when the stored bytes are
    /// unreadable, which surfaces as corruption.
    async fn read_modify_write<T, F>(&self, key: &str, mut apply: F) -> Result<T, GraphError>
    where
        T: Serialize,
        F: FnMut(Option<&[u8]>) -> Option<T>,
    {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        for attempt in 0..MAX_RMW_ATTEMPTS {
            let (current, etag) = match self.store.get_with_etag(key).await {
                Ok((bytes, etag)) => (Some(bytes), Some(etag)),
                Err(e) if e.is_not_found() => (None, None),
                Err(e) => return Err(e.into()),
            };

            let updated = apply(current.as_deref()).ok_or_else(|| GraphError::Corrupted {
                path: key.to_string(),
                reason: "unreadable record".to_string(),
            })?;
            let bytes = serde_json::to_vec(&updated).map_err(|e| GraphError::Corrupted {
                path: key.to_string(),
                reason: e.to_string(),
            })?;

            let opts = match etag {
                Some(etag) => PutOptions::if_match(etag),
                None => PutOptions::if_absent(),
            };
            match self.store.put_opts(key, bytes, opts).await {
                Ok(_) => return Ok(updated),
                Err(StorageError::PreconditionFailed { .. }) => {
                    let backoff = RMW_BACKOFF_BASE_MS * (1 << attempt.min(6));
                    let jitter = rand::rng().random_range(0..=backoff / 4);
                    tracing::debug!(key, attempt, backoff_ms = backoff, "graph write conflict, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(GraphError::Conflict {
            path: key.to_string(),
            attempts: MAX_RMW_ATTEMPTS,
        })
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("lock registry poisoned");
        if locks.len() > LOCK_SWEEP_THRESHOLD {
            // Drop registry entries nobody holds; keyed mutexes are
            // re-created on demand.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}
