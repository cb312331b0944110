//! Unified weighted-LRU cache for index structures.
//!
//! One cache holds deserialized chunks and sparse indices, keyed by their
//! object-store key. Each entry records its byte size and a rebuild-cost
//! weight; eviction walks LRU order but charges each entry
//! `size / rebuild_cost`, so structures that are expensive to reload hang
//! on longer than their raw footprint would allow.

use std::sync::Arc;
use std::sync::Mutex;

use lru::LruCache;

use crate::index::chunk::Chunk;
use crate::index::sparse::SparseIndex;

/// What the cache can hold.
#[derive(Clone)]
pub enum CachedValue {
    Chunk(Arc<Chunk>),
    Sparse(Arc<SparseIndex>),
}

impl CachedValue {
    fn size_bytes(&self) -> usize {
        match self {
            CachedValue::Chunk(c) => c.size_bytes(),
            CachedValue::Sparse(s) => s.size_bytes(),
        }
    }

    /// Relative cost of reloading from the object store. Sparse indices
    /// gate every lookup on their field, so they outrank chunks.
    fn rebuild_cost(&self) -> usize {
        match self {
            CachedValue::Chunk(_) => 1,
            CachedValue::Sparse(_) => 4,
        }
    }

    fn charged_size(&self) -> usize {
        (self.size_bytes() / self.rebuild_cost()).max(1)
    }
}

struct CacheInner {
    entries: LruCache<String, CachedValue>,
    charged_total: usize,
}

pub struct UnifiedCache {
    inner: Mutex<CacheInner>,
    budget: usize,
}

impl UnifiedCache {
    /// `budget` is in charged bytes (size divided by rebuild cost).
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                charged_total: 0,
            }),
            budget,
        }
    }

    pub fn get_chunk(&self, key: &str) -> Option<Arc<Chunk>> {
        let mut inner = self.inner.lock().expect("cache poisoned");
        match inner.entries.get(key) {
            Some(CachedValue::Chunk(c)) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    pub fn get_sparse(&self, key: &str) -> Option<Arc<SparseIndex>> {
        let mut inner = self.inner.lock().expect("cache poisoned");
        match inner.entries.get(key) {
            Some(CachedValue::Sparse(s)) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: CachedValue) {
        let key = key.into();
        let charged = value.charged_size();
        let mut inner = self.inner.lock().expect("cache poisoned");
        if let Some(old) = inner.entries.push(key, value) {
            // push returns the displaced entry (same key or LRU victim)
            inner.charged_total = inner.charged_total.saturating_sub(old.1.charged_size());
        }
        inner.charged_total += charged;
        while inner.charged_total > self.budget {
            let Some((evicted_key, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.charged_total = inner
                .charged_total
                .saturating_sub(evicted.charged_size());
            tracing::trace!(key = %evicted_key, "cache eviction");
        }
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        if let Some(old) = inner.entries.pop(key) {
            inner.charged_total = inner.charged_total.saturating_sub(old.charged_size());
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        inner.entries.clear();
        inner.charged_total = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn charged_bytes(&self) -> usize {
        self.inner.lock().expect("cache poisoned").charged_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::normalize::IndexKey;

    fn chunk_with_values(id: u32, n: u32) -> Arc<Chunk> {
        let mut chunk = Chunk::new(id, "f", 1);
        for i in 0..n {
            chunk.add(&IndexKey::Num(f64::from(i)), i);
        }
        Arc::new(chunk)
    }

    #[test]
    fn test_insert_and_get() {
        let cache = UnifiedCache::new(1 << 20);
        cache.insert("c1", CachedValue::Chunk(chunk_with_values(1, 5)));
        assert!(cache.get_chunk("c1").is_some());
        assert!(cache.get_chunk("c2").is_none());
        assert!(cache.get_sparse("c1").is_none(), "kind mismatch is a miss");
    }

    #[test]
    fn test_eviction_under_budget_pressure() {
        let one = chunk_with_values(1, 50);
        let charged = CachedValue::Chunk(Arc::clone(&one)).charged_size();
        // Budget fits two entries but not three
        let cache = UnifiedCache::new(charged * 2 + charged / 2);

        cache.insert("a", CachedValue::Chunk(Arc::clone(&one)));
        cache.insert("b", CachedValue::Chunk(chunk_with_values(2, 50)));
        cache.insert("c", CachedValue::Chunk(chunk_with_values(3, 50)));

        assert!(cache.get_chunk("a").is_none(), "oldest entry evicted");
        assert!(cache.get_chunk("b").is_some());
        assert!(cache.get_chunk("c").is_some());
    }

    #[test]
    fn test_reinsert_same_key_does_not_leak_accounting() {
        let cache = UnifiedCache::new(1 << 20);
        for _ in 0..10 {
            cache.insert("k", CachedValue::Chunk(chunk_with_values(1, 20)));
        }
        let single = CachedValue::Chunk(chunk_with_values(1, 20)).charged_size();
        assert_eq!(cache.charged_bytes(), single);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = UnifiedCache::new(1 << 20);
        cache.insert("k", CachedValue::Chunk(chunk_with_values(1, 5)));
        cache.remove("k");
        assert!(cache.is_empty());
        assert_eq!(cache.charged_bytes(), 0);

        cache.insert("k", CachedValue::Chunk(chunk_with_values(1, 5)));
        cache.clear();
        assert_eq!(cache.charged_bytes(), 0);
    }
}
