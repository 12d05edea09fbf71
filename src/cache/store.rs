//! Synchronized cache engine
//!
//! Wraps a [`LocalBlobStore`] and a [`StateSynchronizer`]: every operation
//! first refreshes local state (gated by the local TTL), then reads or writes
//! locally, and mutations are published so other participants evict their
//! copies.

use crate::backend::SharedStateBackend;
use crate::cache::{
    config::CacheConfig,
    entry::CacheRecord,
    invalidation::{should_evict, InvalidationReason},
    local::LocalBlobStore,
    sync::{LocalInvalidation, StateSynchronizer, SyncOutcome},
    types::{CacheKey, CacheStats, Invalidation, StateBase, SyncPoint, ValueHash},
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Host lifecycle events the cache reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A request, job or command begins; local state is refreshed
    UnitOfWorkStarted,

    /// The host clears its caches; only this participant's records are dropped
    CacheClearing,
}

/// Local-first cache kept coherent with other participants
///
/// This implementation provides:
/// - File-backed records shared by processes using the same root and identity
/// - Optional in-memory buffering of read records
/// - Incremental invalidation from other participants' writes
/// - TTL-based expiration per record
pub struct SyncedCache {
    /// Cache configuration
    config: CacheConfig,

    /// On-disk records and state
    local: LocalBlobStore,

    /// In-process state, serialized across this participant's operations
    inner: Mutex<EngineState>,
}

struct EngineState {
    sync: StateSynchronizer,

    /// Records read or written since the last full invalidation
    buffer: HashMap<CacheKey, CacheRecord>,

    stats: CacheStats,
}

impl SyncedCache {
    /// Create a participant over `backend`
    pub async fn new(config: CacheConfig, backend: Arc<dyn SharedStateBackend>) -> Result<Self> {
        config.validate().map_err(CacheError::ConfigError)?;
        info!(
            "Initializing synced cache at {} (identity {})",
            config.path.display(),
            config.identity
        );

        let local = LocalBlobStore::from_config(&config);
        local.ensure_root().await?;

        let state = EngineState {
            sync: StateSynchronizer::new(backend, &config),
            buffer: HashMap::new(),
            stats: CacheStats::default(),
        };

        Ok(Self {
            config,
            local,
            inner: Mutex::new(state),
        })
    }

    /// Get a value
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    /// Get the stored record for a key
    pub async fn get_raw(&self, key: &str) -> Result<Option<CacheRecord>> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        self.refresh_locked(state, false).await?;
        self.read_record(state, key).await
    }

    /// Get several values with a single refresh
    pub async fn many<T: DeserializeOwned>(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<CacheKey, Option<T>>> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        self.refresh_locked(state, false).await?;

        let mut values = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = match self.read_record(state, key).await? {
                Some(record) => Some(record.decode()?),
                None => None,
            };
            values.insert(key.to_string(), value);
        }
        Ok(values)
    }

    /// Store a value; a zero TTL never expires
    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let record = CacheRecord::new(value, ttl)?;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        self.refresh_locked(state, false).await?;

        let hash = self.write_record(state, key, record).await?;
        self.publish_locked(state, &[Invalidation::written(key, hash)])
            .await
    }

    /// Store several values and publish them as one version
    pub async fn put_many<K, T, I>(&self, entries: I, ttl: Duration) -> Result<()>
    where
        K: Into<CacheKey>,
        T: Serialize,
        I: IntoIterator<Item = (K, T)>,
    {
        let records = entries
            .into_iter()
            .map(|(key, value)| {
                let key: CacheKey = key.into();
                Ok((key, CacheRecord::new(&value, ttl)?))
            })
            .collect::<Result<Vec<_>>>()?;
        if records.is_empty() {
            return Ok(());
        }

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        self.refresh_locked(state, false).await?;

        let mut invalidations = Vec::with_capacity(records.len());
        for (key, record) in records {
            let hash = self.write_record(state, &key, record).await?;
            invalidations.push(Invalidation::written(key, hash));
        }
        self.publish_locked(state, &invalidations).await
    }

    /// Store a value that never expires
    pub async fn forever<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, value, Duration::ZERO).await
    }

    /// Remove a key here and on every other participant
    ///
    /// Returns whether a local record existed.
    pub async fn forget(&self, key: &str) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        self.refresh_locked(state, false).await?;

        let base = current_base(state)?;
        let existed = {
            let _lock = self.local.lock_record(key).await?;
            self.local.delete(&base, key).await?
        };
        let buffered = state.buffer.remove(key).is_some();
        if existed || buffered {
            state.stats.invalidations += 1;
            debug!("Removed cache entry ({}): {}", InvalidationReason::Forgotten, key);
        }

        self.publish_locked(state, &[Invalidation::deleted(key)])
            .await?;
        Ok(existed)
    }

    /// Counters are not kept atomically; the key is forgotten everywhere
    ///
    /// Returns `by`.
    pub async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        self.forget(key).await?;
        Ok(by)
    }

    /// See [`SyncedCache::increment`]
    pub async fn decrement(&self, key: &str, by: i64) -> Result<i64> {
        self.forget(key).await?;
        Ok(by)
    }

    /// Drop every record on every participant by starting a new epoch
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let _lock = self.local.lock_state().await?;
        let mut view = LocalView {
            blob: &self.local,
            buffer: &mut state.buffer,
            stats: &mut state.stats,
        };
        let point = state.sync.flush(&mut view).await?;

        info!("Flushed cache ({}), now at {}", InvalidationReason::Flush, point);
        Ok(())
    }

    /// Drop this participant's records without touching shared state
    pub async fn flush_local(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let _lock = self.local.lock_state().await?;
        if let Some(point) = self.local.load_state().await? {
            self.local.clear(&point.base).await?;
        }
        let count = state.buffer.len();
        state.buffer.clear();
        state.sync.mark_stale();

        info!(
            "Cleared local cache ({} buffered entries, {})",
            count,
            InvalidationReason::LocalFlush
        );
        Ok(())
    }

    /// Reconcile with shared state
    ///
    /// Without `force`, nothing happens while the local TTL has not elapsed.
    /// Returns the outcome when a reconciliation ran.
    pub async fn refresh_local(&self, force: bool) -> Result<Option<SyncOutcome>> {
        let mut guard = self.inner.lock().await;
        self.refresh_locked(&mut guard, force).await
    }

    /// Drop the local cache and re-adopt global state
    pub async fn resync(&self) -> Result<SyncOutcome> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let _lock = self.local.lock_state().await?;
        let mut view = LocalView {
            blob: &self.local,
            buffer: &mut state.buffer,
            stats: &mut state.stats,
        };
        let outcome = state.sync.reconcile(&mut view, true).await?;
        record_outcome(&mut state.stats, &outcome);
        Ok(outcome)
    }

    /// React to a host lifecycle event
    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<()> {
        if !self.config.listen_events {
            debug!("Ignoring lifecycle event {:?}", event);
            return Ok(());
        }

        match event {
            LifecycleEvent::UnitOfWorkStarted => {
                self.refresh_local(true).await?;
            }
            LifecycleEvent::CacheClearing => self.flush_local().await?,
        }
        Ok(())
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        self.inner.lock().await.stats.clone()
    }

    /// Sync point last applied by this participant
    pub async fn sync_state(&self) -> Option<SyncPoint> {
        self.inner.lock().await.sync.state().cloned()
    }

    /// Number of records held in memory
    pub async fn buffered_len(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    pub fn blob_store(&self) -> &LocalBlobStore {
        &self.local
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn refresh_locked(
        &self,
        state: &mut EngineState,
        force: bool,
    ) -> Result<Option<SyncOutcome>> {
        if !force && state.sync.is_fresh() {
            return Ok(None);
        }

        let _lock = self.local.lock_state().await?;
        let mut view = LocalView {
            blob: &self.local,
            buffer: &mut state.buffer,
            stats: &mut state.stats,
        };
        let outcome = state.sync.reconcile(&mut view, false).await?;
        record_outcome(&mut state.stats, &outcome);
        Ok(Some(outcome))
    }

    async fn publish_locked(&self, state: &mut EngineState, invalidations: &[Invalidation]) -> Result<()> {
        let _lock = self.local.lock_state().await?;
        let mut view = LocalView {
            blob: &self.local,
            buffer: &mut state.buffer,
            stats: &mut state.stats,
        };
        state.sync.publish(&mut view, invalidations).await?;
        state.stats.publishes += 1;
        Ok(())
    }

    async fn read_record(&self, state: &mut EngineState, key: &str) -> Result<Option<CacheRecord>> {
        if self.config.buffered {
            if let Some(record) = state.buffer.get(key) {
                if !record.is_expired() {
                    debug!("Cache hit (buffered): {}", key);
                    state.stats.hits += 1;
                    state.stats.buffer_hits += 1;
                    return Ok(Some(record.clone()));
                }
                state.buffer.remove(key);
            }
        }

        let base = current_base(state)?;
        let Some(bytes) = self.local.get(&base, key).await? else {
            debug!("Cache miss: {}", key);
            state.stats.misses += 1;
            return Ok(None);
        };

        let record = match CacheRecord::from_bytes(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!("Discarding unreadable cache entry {}: {}", key, e);
                self.evict(&base, key).await?;
                state.stats.misses += 1;
                return Ok(None);
            }
        };

        if record.is_expired() {
            debug!("Cache entry evicted ({}): {}", InvalidationReason::Expired, key);
            self.evict(&base, key).await?;
            state.stats.evictions_ttl += 1;
            state.stats.misses += 1;
            return Ok(None);
        }

        if self.config.buffered {
            state.buffer.insert(key.to_string(), record.clone());
        }
        debug!("Cache hit: {}", key);
        state.stats.hits += 1;
        Ok(Some(record))
    }

    async fn write_record(
        &self,
        state: &mut EngineState,
        key: &str,
        record: CacheRecord,
    ) -> Result<ValueHash> {
        let base = current_base(state)?;
        let hash = record.value_hash();
        let bytes = record.to_bytes()?;

        {
            let _lock = self.local.lock_record(key).await?;
            self.local.put(&base, key, &bytes).await?;
        }

        if self.config.buffered {
            state.buffer.insert(key.to_string(), record);
        }
        state.stats.writes += 1;
        debug!("Stored cache entry: {}", key);
        Ok(hash)
    }

    async fn evict(&self, base: &StateBase, key: &str) -> Result<()> {
        let _lock = self.local.lock_record(key).await?;
        self.local.delete(base, key).await?;
        Ok(())
    }
}

fn current_base(state: &EngineState) -> Result<StateBase> {
    state
        .sync
        .state()
        .map(|point| point.base.clone())
        .ok_or_else(|| CacheError::SyncError("no synchronized state".to_string()))
}

fn record_outcome(stats: &mut CacheStats, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::UpToDate => {}
        SyncOutcome::Incremental { .. } => stats.incremental_syncs += 1,
        SyncOutcome::Full { .. } => stats.full_syncs += 1,
    }
}

/// Local side of reconciliation for the engine: blob store plus memory buffer
struct LocalView<'a> {
    blob: &'a LocalBlobStore,
    buffer: &'a mut HashMap<CacheKey, CacheRecord>,
    stats: &'a mut CacheStats,
}

#[async_trait]
impl<'a> LocalInvalidation for LocalView<'a> {
    async fn load_state(&mut self) -> Result<Option<SyncPoint>> {
        self.blob.load_state().await
    }

    async fn persist_state(&mut self, point: &SyncPoint) -> Result<()> {
        self.blob.persist_state(point).await
    }

    async fn forget_if_modified(
        &mut self,
        base: &StateBase,
        key: &str,
        hash: &ValueHash,
    ) -> Result<bool> {
        let mut evicted = false;

        if let Some(record) = self.buffer.get(key) {
            if should_evict(Some(&record.value_hash()), hash) {
                self.buffer.remove(key);
                evicted = true;
            }
        }

        if let Some(bytes) = self.blob.get(base, key).await? {
            // Unreadable records count as modified
            let current = CacheRecord::from_bytes(&bytes)
                .map(|record| record.value_hash())
                .ok();
            if should_evict(current.as_ref(), hash) {
                self.blob.delete(base, key).await?;
                evicted = true;
            }
        }

        if evicted {
            self.stats.invalidations += 1;
            debug!("Cache entry invalidated ({}): {}", InvalidationReason::Modified, key);
        }
        Ok(evicted)
    }

    async fn invalidate_all(&mut self, base: &StateBase) -> Result<()> {
        self.blob.clear(base).await?;
        self.buffer.clear();
        Ok(())
    }

    async fn retire_base(&mut self, point: &SyncPoint) -> Result<()> {
        self.blob.retire_scope(point).await
    }

    async fn drop_buffered(&mut self) {
        self.buffer.clear();
    }
}
