//! UUID ↔ dense integer interning.
//!
//! Bitmaps hold 32-bit values, so every external UUID is assigned a dense
//! u32 the first time it is seen. The mapping is bijective and append-only:
//! the same UUID never receives two integers, and integers are never
//! reassigned except through an explicit [`IdMapper::clear`] during rebuild.
//! This caps the engine at ~4 billion live entities.
//!
//! Persisted as a single JSON record under `__entity_id_mapper__`; the
//! forward map is reconstructed from the dense vector on load, so the wire
//! form is just the ordered UUID list.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{keys, ObjectStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum InternerError {
    #[error("id mapper record is corrupted: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Bijection between external UUIDs and dense u32 ids.
#[derive(Debug, Default)]
pub struct IdMapper {
    uuid_to_int: HashMap<Uuid, u32>,
    int_to_uuid: Vec<Uuid>,
    dirty: bool,
}

/// Wire form: the dense vector alone carries the whole bijection.
#[derive(Serialize, Deserialize)]
struct IdMapperRecord {
    ids: Vec<Uuid>,
    next_id: u32,
}

impl IdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next integer that would be assigned.
    pub fn next_id(&self) -> u32 {
        self.int_to_uuid.len() as u32
    }

    pub fn len(&self) -> usize {
        self.int_to_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.int_to_uuid.is_empty()
    }

    /// Return the existing integer for `uuid` or assign the next one.
    pub fn get_or_intern(&mut self, uuid: Uuid) -> u32 {
        if let Some(&id) = self.uuid_to_int.get(&uuid) {
            return id;
        }
        let id = self.int_to_uuid.len() as u32;
        self.int_to_uuid.push(uuid);
        self.uuid_to_int.insert(uuid, id);
        self.dirty = true;
        id
    }

    /// Pure lookup, no assignment.
    pub fn get(&self, uuid: &Uuid) -> Option<u32> {
        self.uuid_to_int.get(uuid).copied()
    }

    pub fn resolve(&self, id: u32) -> Option<Uuid> {
        self.int_to_uuid.get(id as usize).copied()
    }

    /// Resolve many ids, preserving input order. Unknown ids are dropped;
    /// they cannot occur while bitmaps are maintained correctly, so
    /// dropping is defensive rather than expected.
    pub fn bulk_resolve(&self, ids: impl IntoIterator<Item = u32>) -> Vec<Uuid> {
        ids.into_iter()
            .filter_map(|id| {
                let uuid = self.resolve(id);
                if uuid.is_none() {
                    tracing::warn!(int_id = id, "dropping unknown id during bulk resolve");
                }
                uuid
            })
            .collect()
    }

    /// Reset the bijection. Used only by rebuild.
    pub fn clear(&mut self) {
        self.uuid_to_int.clear();
        self.int_to_uuid.clear();
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist to the object store. Each assignment is idempotent, so a
    /// partial flush that is retried later cannot corrupt the bijection.
    pub async fn flush(&mut self, store: &dyn ObjectStore) -> Result<(), InternerError> {
        if !self.dirty {
            return Ok(());
        }
        let record = IdMapperRecord {
            ids: self.int_to_uuid.clone(),
            next_id: self.next_id(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| InternerError::Corrupted(e.to_string()))?;
        store.put(keys::ID_MAPPER, bytes).await?;
        self.dirty = false;
        tracing::debug!(entries = self.int_to_uuid.len(), "id mapper flushed");
        Ok(())
    }

    /// Load from the object store. Absent record means a fresh database.
    pub async fn load(store: &dyn ObjectStore) -> Result<Self, InternerError> {
        let bytes = match store.get(keys::ID_MAPPER).await {
            Ok(b) => b,
            Err(StorageError::NotFound { .. }) => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let record: IdMapperRecord = serde_json::from_slice(&bytes)
            .map_err(|e| InternerError::Corrupted(e.to_string()))?;
        if record.next_id as usize != record.ids.len() {
            return Err(InternerError::Corrupted(format!(
                "next_id {} disagrees with {} stored ids",
                record.next_id,
                record.ids.len()
            )));
        }
        let mut uuid_to_int = HashMap::with_capacity(record.ids.len());
        for (i, uuid) in record.ids.iter().enumerate() {
            if uuid_to_int.insert(*uuid, i as u32).is_some() {
                return Err(InternerError::Corrupted(format!(
                    "uuid {uuid} appears twice in id mapper"
                )));
            }
        }
        tracing::debug!(entries = record.ids.len(), "id mapper loaded");
        Ok(Self {
            uuid_to_int,
            int_to_uuid: record.ids,
            dirty: false,
        })
    }
}
