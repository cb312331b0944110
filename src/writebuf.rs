//! Write buffering, batching, and backpressure.
//!
//! Cloud blob writes are latency-bound; the answer here is two layers:
//!
//! - A **coalescing buffer** keyed by object path. `write` replaces any
//!   prior in-flight value for the same key (last-write-wins within the
//!   buffer), and a flush is triggered by buffer size, elapsed time, or an
//!   explicit call. Backends that report `is_cloud_storage()` always route
//!   through the buffer; local and in-memory backends bypass it.
//! - **Adaptive backpressure**: a concurrency cap that every physical write
//!   acquires a permit from. A moving average of the error rate halves the
//!   cap when the backend starts failing and doubles it back toward the
//!   ceiling after a cool-down of successes. `Throttled` errors retry with
//!   jittered exponential backoff inside this layer; callers only see them
//!   as reduced throughput.
//!
//! Ordering: for one key, the latest value submitted before a flush is the
//! value persisted; intermediate values may be discarded. Across keys there
//! is no ordering guarantee. Flushes are serialized, which is what makes
//! same-key writes linearizable. A flush either completes or surfaces a
//! flush error; there is no partial-flush cancellation path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::RngExt;
use tokio::sync::{Mutex, Notify};

use crate::storage::{ObjectStore, StorageError};

/// Tuning for the buffer and the backpressure gate.
#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    /// Flush when this many coalesced entries are pending.
    pub max_buffer_size: usize,
    /// Flush when this much time has passed since the last flush.
    pub flush_interval: Duration,
    /// Initial and maximum concurrent physical writes.
    pub max_concurrent: usize,
    /// Error-rate EMA above which the concurrency cap is halved.
    pub error_threshold: f64,
    /// Consecutive successes required before the cap doubles back.
    pub recovery_successes: u32,
    /// Attempts per write for `Throttled` errors before giving up.
    pub max_throttle_retries: u32,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            flush_interval: Duration::from_secs(1),
            max_concurrent: 16,
            error_threshold: 0.3,
            recovery_successes: 16,
            max_throttle_retries: 6,
        }
    }
}

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 5_000;

/// EMA smoothing factor for the error rate.
const ERROR_EMA_ALPHA: f64 = 0.1;

struct GateState {
    limit: usize,
    in_flight: usize,
    error_ema: f64,
    success_streak: u32,
}

/// Adaptive concurrency gate. Not a `tokio::sync::Semaphore` because the
/// capacity must shrink when the backend degrades, and semaphore permits
/// cannot be revoked once issued.
pub struct Backpressure {
    state: StdMutex<GateState>,
    notify: Notify,
    ceiling: usize,
    error_threshold: f64,
    recovery_successes: u32,
}

impl Backpressure {
    pub fn new(max_concurrent: usize, error_threshold: f64, recovery_successes: u32) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            state: StdMutex::new(GateState {
                limit,
                in_flight: 0,
                error_ema: 0.0,
                success_streak: 0,
            }),
            notify: Notify::new(),
            ceiling: limit,
            error_threshold,
            recovery_successes,
        }
    }

    /// Current concurrency cap (shrinks under error bursts).
    pub fn current_limit(&self) -> usize {
        self.state.lock().expect("gate state poisoned").limit
    }

    /// Wait for a permit. The returned guard releases on any exit path.
    pub async fn acquire(self: &Arc<Self>) -> Permit {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("gate state poisoned");
                if state.in_flight < state.limit {
                    state.in_flight += 1;
                    return Permit {
                        gate: Arc::clone(self),
                    };
                }
            }
            notified.await;
        }
    }

    /// Feed an outcome into the error-rate EMA and adapt the cap.
    pub fn record_outcome(&self, success: bool) {
        let mut state = self.state.lock().expect("gate state poisoned");
        let sample = if success { 0.0 } else { 1.0 };
        state.error_ema = state.error_ema * (1.0 - ERROR_EMA_ALPHA) + sample * ERROR_EMA_ALPHA;

        if success {
            state.success_streak += 1;
            if state.success_streak >= self.recovery_successes && state.limit < self.ceiling {
                state.limit = (state.limit * 2).min(self.ceiling);
                state.success_streak = 0;
                tracing::debug!(limit = state.limit, "backpressure cap raised");
                self.notify.notify_waiters();
            }
        } else {
            state.success_streak = 0;
            if state.error_ema > self.error_threshold && state.limit > 1 {
                state.limit = (state.limit / 2).max(1);
                // Decay the EMA so one burst does not keep halving forever.
                state.error_ema /= 2.0;
                tracing::warn!(
                    limit = state.limit,
                    error_ema = state.error_ema,
                    "backpressure cap halved"
                );
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("gate state poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Scoped permit; releases its slot when dropped.
pub struct Permit {
    gate: Arc<Backpressure>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Jittered exponential backoff delay for attempt `n` (0-based).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0..=capped / 2);
    Duration::from_millis(capped / 2 + jitter)
}

/// Coalescing write buffer over an object store.
pub struct WriteBuffer {
    store: Arc<dyn ObjectStore>,
    gate: Arc<Backpressure>,
    pending: Mutex<HashMap<String, Vec<u8>>>,
    /// Serializes flushes; same-key ordering depends on it.
    flush_lock: Mutex<()>,
    last_flush: StdMutex<Instant>,
    flushed_writes: AtomicU64,
    config: WriteBufferConfig,
    buffering: bool,
}

impl WriteBuffer {
    pub fn new(store: Arc<dyn ObjectStore>, config: WriteBufferConfig) -> Self {
        let buffering = store.is_cloud_storage();
        let gate = Arc::new(Backpressure::new(
            config.max_concurrent,
            config.error_threshold,
            config.recovery_successes,
        ));
        tracing::debug!(
            buffering,
            max_concurrent = config.max_concurrent,
            "write buffer created"
        );
        Self {
            store,
            gate,
            pending: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
            last_flush: StdMutex::new(Instant::now()),
            flushed_writes: AtomicU64::new(0),
            config,
            buffering,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Total physical writes that have gone through the buffer. Used by
    /// engine statistics.
    pub fn flushed_writes(&self) -> u64 {
        self.flushed_writes.load(AtomicOrdering::Relaxed)
    }

    /// Submit a write. Buffered backends coalesce; others write through
    /// immediately under the backpressure gate.
    pub async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        if !self.buffering {
            return self.physical_write(path.to_string(), bytes).await;
        }

        let should_flush = {
            let mut pending = self.pending.lock().await;
            pending.insert(path.to_string(), bytes);
            pending.len() >= self.config.max_buffer_size
        } || self
            .last_flush
            .lock()
            .expect("flush clock poisoned")
            .elapsed()
            >= self.config.flush_interval;

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Delete a key, dropping any coalesced value queued for it first so a
    /// later flush cannot resurrect the object.
    pub async fn delete(&self, path: &str) -> Result<(), StorageError> {
        if self.buffering {
            self.pending.lock().await.remove(path);
        }
        let _permit = self.gate.acquire().await;
        let result = self.store.delete(path).await;
        self.gate.record_outcome(result.is_ok());
        result
    }

    /// Drain and persist all pending writes. Completes fully or surfaces
    /// the first error; writes submitted mid-flush land in the next one.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let _flush_guard = self.flush_lock.lock().await;
        let drained: Vec<(String, Vec<u8>)> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        *self.last_flush.lock().expect("flush clock poisoned") = Instant::now();
        if drained.is_empty() {
            return Ok(());
        }

        let batch = drained.len();
        let results: Vec<Result<(), StorageError>> = futures::stream::iter(drained)
            .map(|(path, bytes)| self.physical_write(path, bytes))
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;

        let mut first_err = None;
        let mut failed = 0usize;
        for result in results {
            if let Err(e) = result {
                failed += 1;
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if let Some(e) = first_err {
            tracing::warn!(batch, failed, error = %e, "flush incomplete");
            return Err(e);
        }
        tracing::debug!(batch, "flush complete");
        Ok(())
    }

    /// One physical write: permit, throttle retries, outcome recording.
    async fn physical_write(&self, path: String, bytes: Vec<u8>) -> Result<(), StorageError> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let _permit = self.gate.acquire().await;
                self.store.put(&path, bytes.clone()).await
            };
            match result {
                Ok(()) => {
                    self.gate.record_outcome(true);
                    self.flushed_writes.fetch_add(1, AtomicOrdering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.is_throttled() && attempt < self.config.max_throttle_retries => {
                    self.gate.record_outcome(false);
                    let delay = backoff_delay(attempt);
                    attempt += 1;
                    tracing::debug!(path = %path, attempt, delay_ms = delay.as_millis() as u64, "throttled, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.gate.record_outcome(false);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, PutOptions};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::atomic::AtomicU32;

    /// MemoryStore wrapper that reports as cloud and fails the first N puts
    /// per key with `Throttled`.
    struct ThrottlingStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
        puts: AtomicU32,
    }

    impl ThrottlingStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicU32::new(failures),
                puts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for ThrottlingStore {
        async fn put_opts(
            &self,
            path: &str,
            bytes: Vec<u8>,
            opts: PutOptions,
        ) -> Result<String, StorageError> {
            self.puts.fetch_add(1, AtomicOrdering::Relaxed);
            let left = self.failures_left.load(AtomicOrdering::Relaxed);
            if left > 0 {
                self.failures_left.store(left - 1, AtomicOrdering::Relaxed);
                return Err(StorageError::Throttled);
            }
            self.inner.put_opts(path, bytes, opts).await
        }

        async fn get_with_etag(&self, path: &str) -> Result<(Vec<u8>, String), StorageError> {
            self.inner.get_with_etag(path).await
        }

        async fn delete(&self, path: &str) -> Result<(), StorageError> {
            self.inner.delete(path).await
        }

        fn list(&self, prefix: &str) -> BoxStream<'_, Result<String, StorageError>> {
            self.inner.list(prefix)
        }

        fn is_cloud_storage(&self) -> bool {
            true
        }
    }

    fn fast_config() -> WriteBufferConfig {
        WriteBufferConfig {
            max_buffer_size: 4,
            flush_interval: Duration::from_secs(3600),
            max_concurrent: 4,
            ..WriteBufferConfig::default()
        }
    }

    #[tokio::test]
    async fn test_local_backend_bypasses_buffer() {
        let store = Arc::new(MemoryStore::new());
        let buffer = WriteBuffer::new(store.clone(), fast_config());
        buffer.write("k", b"v".to_vec()).await.unwrap();
        // Visible without a flush
        assert_eq!(store.get("k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_cloud_backend_coalesces_last_write_wins() {
        let store = Arc::new(ThrottlingStore::new(0));
        let buffer = WriteBuffer::new(store.clone(), fast_config());
        buffer.write("k", b"v1".to_vec()).await.unwrap();
        buffer.write("k", b"v2".to_vec()).await.unwrap();
        buffer.write("k", b"v3".to_vec()).await.unwrap();

        // Nothing persisted yet (buffer below threshold, interval long)
        assert!(store.inner.get("k").await.is_err());

        buffer.flush().await.unwrap();
        assert_eq!(store.inner.get("k").await.unwrap(), b"v3");
        // Coalescing: exactly one physical put
        assert_eq!(store.puts.load(AtomicOrdering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_flush() {
        let store = Arc::new(ThrottlingStore::new(0));
        let buffer = WriteBuffer::new(store.clone(), fast_config());
        for i in 0..4 {
            buffer
                .write(&format!("k{i}"), vec![i as u8])
                .await
                .unwrap();
        }
        // Fourth write crossed max_buffer_size → flushed
        assert_eq!(store.inner.len().await, 4);
    }

    #[tokio::test]
    async fn test_throttled_writes_retry_and_succeed() {
        let store = Arc::new(ThrottlingStore::new(2));
        let buffer = WriteBuffer::new(store.clone(), fast_config());
        buffer.write("k", b"v".to_vec()).await.unwrap();
        buffer.flush().await.unwrap();
        assert_eq!(store.inner.get("k").await.unwrap(), b"v");
        // 2 throttled attempts + 1 success
        assert_eq!(store.puts.load(AtomicOrdering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_delete_drops_pending_write() {
        let store = Arc::new(ThrottlingStore::new(0));
        let buffer = WriteBuffer::new(store.clone(), fast_config());
        buffer.write("k", b"v".to_vec()).await.unwrap();
        buffer.delete("k").await.unwrap();
        buffer.flush().await.unwrap();
        // The coalesced value must not resurrect the deleted key
        assert!(store.inner.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_backpressure_cap_halves_and_recovers() {
        let gate = Arc::new(Backpressure::new(8, 0.3, 4));
        assert_eq!(gate.current_limit(), 8);

        for _ in 0..10 {
            gate.record_outcome(false);
        }
        assert!(gate.current_limit() < 8, "cap should shrink under errors");

        for _ in 0..64 {
            gate.record_outcome(true);
        }
        assert_eq!(gate.current_limit(), 8, "cap should recover to ceiling");
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let gate = Arc::new(Backpressure::new(1, 0.3, 4));
        {
            let _p = gate.acquire().await;
        }
        // Second acquire must not deadlock
        let _p2 = gate.acquire().await;
    }
}
