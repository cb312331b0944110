//! Local filesystem backend.
//!
//! Keys map directly onto paths under a base directory. Writes go through
//! a temp file in the same directory followed by a rename, so readers never
//! observe a half-written record. ETags are blake3 content hashes; within a
//! single process the graph layer additionally serializes read-modify-write
//! per key, which is what makes content-hash preconditions sufficient here
//! (single-writer backend).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::{ObjectStore, PutOptions, StorageError};

pub struct LocalStore {
    base: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `base`.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        tracing::info!(base = %base.display(), "local object store opened");
        Ok(Self { base })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("empty key".to_string()));
        }
        let mut path = self.base.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StorageError::InvalidArgument(format!(
                    "key contains invalid segment: {key}"
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn etag_of(bytes: &[u8]) -> String {
        blake3::hash(bytes).to_hex().to_string()
    }

    fn map_io(path: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound {
                path: path.to_string(),
            }
        } else {
            StorageError::Io(e)
        }
    }

    async fn current_etag(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Self::etag_of(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn collect_keys(base: &Path, dir: &Path, prefix: &str, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::collect_keys(base, &path, prefix, out);
            } else if let Ok(rel) = path.strip_prefix(base) {
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_opts(
        &self,
        key: &str,
        bytes: Vec<u8>,
        opts: PutOptions,
    ) -> Result<String, StorageError> {
        let path = self.resolve(key)?;

        if opts.if_match.is_some() || opts.if_none_match.is_some() {
            let current = self.current_etag(key).await?;
            if let Some(expected) = &opts.if_match {
                if current.as_deref() != Some(expected.as_str()) {
                    return Err(StorageError::PreconditionFailed {
                        path: key.to_string(),
                    });
                }
            }
            if let Some(none_match) = &opts.if_none_match {
                let violated = match &current {
                    Some(etag) => none_match == "*" || etag == none_match,
                    None => false,
                };
                if violated {
                    return Err(StorageError::PreconditionFailed {
                        path: key.to_string(),
                    });
                }
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Temp file lands in the target directory so the rename stays on
        // one filesystem and is atomic.
        let etag = Self::etag_of(&bytes);
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::Internal(format!("key has no parent dir: {key}")))?
            .to_path_buf();
        let tmp = tokio::task::spawn_blocking(move || {
            tempfile::NamedTempFile::new_in(parent)
        })
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))??;

        let tmp_path = tmp.path().to_path_buf();
        {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        tokio::task::spawn_blocking(move || tmp.persist(path))
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .map_err(|e| StorageError::Io(e.error))?;

        Ok(etag)
    }

    async fn get_with_etag(&self, key: &str) -> Result<(Vec<u8>, String), StorageError> {
        let path = self.resolve(key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        let etag = Self::etag_of(&bytes);
        Ok((bytes, etag))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn list(&self, prefix: &str) -> BoxStream<'_, Result<String, StorageError>> {
        let base = self.base.clone();
        let prefix = prefix.to_string();
        Box::pin(
            futures::stream::once(async move {
                let keys = tokio::task::spawn_blocking(move || {
                    let mut out = Vec::new();
                    Self::collect_keys(&base, &base, &prefix, &mut out);
                    out.sort();
                    out
                })
                .await
                .unwrap_or_default();
                futures::stream::iter(keys.into_iter().map(Ok))
            })
            .flatten(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn temp_store() -> (LocalStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (store, _dir) = temp_store();
        store
            .put("entities/nouns/metadata/ab/x.json", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.get("entities/nouns/metadata/ab/x.json").await.unwrap(),
            b"{}"
        );
    }

    #[tokio::test]
    async fn test_absent_key_is_not_found() {
        let (store, _dir) = temp_store();
        assert!(store.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (store, _dir) = temp_store();
        let err = store.get("../outside").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_etag_tracks_content() {
        let (store, _dir) = temp_store();
        let etag1 = store
            .put_opts("k", b"one".to_vec(), PutOptions::default())
            .await
            .unwrap();
        let (_, read_etag) = store.get_with_etag("k").await.unwrap();
        assert_eq!(etag1, read_etag);

        store.put("k", b"two".to_vec()).await.unwrap();
        let (_, etag2) = store.get_with_etag("k").await.unwrap();
        assert_ne!(etag1, etag2);
    }

    #[tokio::test]
    async fn test_if_match_detects_interleaved_write() {
        let (store, _dir) = temp_store();
        let etag = store
            .put_opts("k", b"v1".to_vec(), PutOptions::default())
            .await
            .unwrap();
        store.put("k", b"v2".to_vec()).await.unwrap();
        let err = store
            .put_opts("k", b"v3".to_vec(), PutOptions::if_match(etag))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_returns_nested_keys_sorted() {
        let (store, _dir) = temp_store();
        store.put("p/b/2.json", vec![2]).await.unwrap();
        store.put("p/a/1.json", vec![1]).await.unwrap();
        store.put("q/other", vec![3]).await.unwrap();

        let keys: Vec<String> = store.list("p/").try_collect().await.unwrap();
        assert_eq!(keys, vec!["p/a/1.json", "p/b/2.json"]);
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (store, _dir) = temp_store();
        store.put("k", vec![1]).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
    }
}
