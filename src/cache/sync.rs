//! Reconciliation of local state against the shared backend
//!
//! Global state is a `(base, version)` pair. Every publish increments the
//! version of the current base and stores the list of keys written in that
//! version. A participant that is a few versions behind replays those lists
//! and evicts just the keys whose hash differs from what it holds; anything it
//! cannot reconcile that way falls back to dropping its whole local cache.
//!
//! Callers hold the per-identity state lock around every method that touches
//! the local side.

use crate::backend::{SharedStateBackend, StateKeys};
use crate::cache::config::CacheConfig;
use crate::cache::invalidation::{merge_logs, InvalidationReason, ResyncCause};
use crate::cache::types::{Invalidation, ModificationLog, StateBase, SyncPoint, ValueHash};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Local side of reconciliation
///
/// Implemented by the cache engine over its blob store and memory buffer.
#[async_trait]
pub trait LocalInvalidation: Send {
    /// Read the persisted sync point; `None` when missing or corrupt
    async fn load_state(&mut self) -> Result<Option<SyncPoint>>;

    /// Persist a new sync point
    async fn persist_state(&mut self, point: &SyncPoint) -> Result<()>;

    /// Evict the local copy of `key` under `base` unless it carries `hash`
    ///
    /// Returns whether anything was evicted.
    async fn forget_if_modified(
        &mut self,
        base: &StateBase,
        key: &str,
        hash: &ValueHash,
    ) -> Result<bool>;

    /// Drop every local record of `base`
    async fn invalidate_all(&mut self, base: &StateBase) -> Result<()>;

    /// Remember that `point.base` was abandoned
    async fn retire_base(&mut self, point: &SyncPoint) -> Result<()>;

    /// Drop in-memory copies of records
    ///
    /// Called when persisted state moved without this synchronizer, which
    /// means another process sharing the root already reconciled the files.
    async fn drop_buffered(&mut self) {}
}

/// Result of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local state already matched global state
    UpToDate,

    /// Logs were replayed from `from + 1` to `to`
    Incremental { from: u64, to: u64, evicted: usize },

    /// The local cache was dropped and `target` adopted
    Full { target: SyncPoint, cause: ResyncCause },
}

impl SyncOutcome {
    pub fn is_full(&self) -> bool {
        matches!(self, SyncOutcome::Full { .. })
    }
}

/// Drives the synchronization protocol for one local root
pub struct StateSynchronizer {
    backend: Arc<dyn SharedStateBackend>,
    keys: StateKeys,
    config: CacheConfig,
    state: Option<SyncPoint>,
    last_synced: Option<Instant>,
    window: Duration,
}

impl StateSynchronizer {
    pub fn new(backend: Arc<dyn SharedStateBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            keys: StateKeys::new(config.shared_prefix.clone()),
            config: config.clone(),
            state: None,
            last_synced: None,
            window: config.local_ttl_with_jitter(),
        }
    }

    /// Last sync point applied by this synchronizer
    pub fn state(&self) -> Option<&SyncPoint> {
        self.state.as_ref()
    }

    pub fn keys(&self) -> &StateKeys {
        &self.keys
    }

    /// Whether local state is still trusted without asking the backend
    pub fn is_fresh(&self) -> bool {
        match self.last_synced {
            Some(at) => at.elapsed() <= self.window,
            None => false,
        }
    }

    /// Force the next refresh to consult the backend
    pub fn mark_stale(&mut self) {
        self.last_synced = None;
    }

    fn touch(&mut self) {
        self.last_synced = Some(Instant::now());
        self.window = self.config.local_ttl_with_jitter();
    }

    /// Bring local state in line with global state
    ///
    /// `force_full` ignores the persisted local state and always drops the
    /// local cache.
    pub async fn reconcile<L: LocalInvalidation + ?Sized>(
        &mut self,
        local: &mut L,
        force_full: bool,
    ) -> Result<SyncOutcome> {
        // Another process sharing the root may have moved the state on disk
        let previous = local.load_state().await?;
        if self.state.is_some() && previous != self.state {
            debug!("Local state moved by another process, dropping buffered records");
            local.drop_buffered().await;
        }
        let current = if force_full { None } else { previous.clone() };
        let global = self.read_global().await?;

        let (current, global) = match (current, global) {
            (None, global) => {
                return self
                    .full_resync(local, previous, global, ResyncCause::Unsynced)
                    .await
            }
            (Some(_), None) => {
                return self
                    .full_resync(local, previous, None, ResyncCause::BackendReset)
                    .await
            }
            (Some(current), Some(global)) => (current, global),
        };

        if global.base != current.base {
            return self
                .full_resync(local, previous, Some(global), ResyncCause::UnknownBase)
                .await;
        }

        if global.version < current.version {
            return self
                .full_resync(local, previous, Some(global), ResyncCause::VersionRollback)
                .await;
        }

        if global.version == current.version {
            self.state = Some(current);
            self.touch();
            return Ok(SyncOutcome::UpToDate);
        }

        let gap = global.version - current.version;
        if gap > self.config.max_catchup_versions {
            return self
                .full_resync(
                    local,
                    previous,
                    Some(global),
                    ResyncCause::CatchupLimitExceeded { gap },
                )
                .await;
        }

        let logs = match self.fetch_logs(&global.base, current.version, global.version).await? {
            Ok(logs) => logs,
            Err(version) => {
                return self
                    .full_resync(
                        local,
                        previous,
                        Some(global),
                        ResyncCause::LogMissing { version },
                    )
                    .await
            }
        };

        let mut evicted = 0;
        for (key, hash) in merge_logs(&logs) {
            if local.forget_if_modified(&global.base, &key, &hash).await? {
                evicted += 1;
            }
        }

        local.persist_state(&global).await?;
        debug!(
            "Caught up from {} to {} ({} keys evicted)",
            current, global, evicted
        );

        let outcome = SyncOutcome::Incremental {
            from: current.version,
            to: global.version,
            evicted,
        };
        self.state = Some(global);
        self.touch();
        Ok(outcome)
    }

    /// Publish the keys written by a local mutation
    ///
    /// Returns the version the invalidations were published under.
    pub async fn publish<L: LocalInvalidation + ?Sized>(
        &mut self,
        local: &mut L,
        invalidations: &[Invalidation],
    ) -> Result<u64> {
        let payload = serde_json::to_value(invalidations)?;

        for attempt in 1..=self.config.max_publish_attempts {
            let global_base = self.read_base().await?;
            let aligned = match (&self.state, &global_base) {
                (Some(point), Some(base)) => &point.base == base,
                _ => false,
            };
            if !aligned {
                self.reconcile(local, false).await?;
            }

            let Some(point) = self.state.clone() else {
                continue;
            };

            let raw = self
                .backend
                .increment(&self.keys.version(point.base.as_str()))
                .await
                .map_err(|e| CacheError::SyncError(format!("failed to advance version: {}", e)))?;
            let version = u64::try_from(raw)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| {
                    CacheError::SyncError(format!("backend returned invalid version {}", raw))
                })?;

            self.backend
                .set(&self.keys.log(point.base.as_str(), version), payload.clone())
                .await
                .map_err(|e| {
                    CacheError::SyncError(format!(
                        "failed to write log for version {}: {}",
                        version, e
                    ))
                })?;

            if self.read_base().await?.as_ref() != Some(&point.base) {
                warn!(
                    "Global base moved while publishing version {} (attempt {}/{})",
                    version, attempt, self.config.max_publish_attempts
                );
                continue;
            }

            if version == point.version + 1 {
                let next = SyncPoint::new(point.base, version);
                local.persist_state(&next).await?;
                self.state = Some(next);
                self.touch();
            } else {
                // Other participants published in between; replay them on the next refresh
                debug!(
                    "Published version {} while at {}, catching up on next refresh",
                    version, point
                );
                self.mark_stale();
            }

            debug!("Published {} invalidations as version {}", invalidations.len(), version);
            return Ok(version);
        }

        Err(CacheError::SyncError(format!(
            "global state kept changing, gave up publishing after {} attempts",
            self.config.max_publish_attempts
        )))
    }

    /// Start a new global epoch
    pub async fn reset_globally(&mut self) -> Result<SyncPoint> {
        let point = SyncPoint::genesis();
        self.write_global(&point).await?;
        info!("Reset shared cache state to new base {}", point.base);
        Ok(point)
    }

    /// Start a new global epoch and drop the local cache of both epochs
    pub async fn flush<L: LocalInvalidation + ?Sized>(&mut self, local: &mut L) -> Result<SyncPoint> {
        if let Some(previous) = local.load_state().await? {
            local.invalidate_all(&previous.base).await?;
        }

        let point = self.reset_globally().await?;
        local.invalidate_all(&point.base).await?;
        local.persist_state(&point).await?;
        self.state = Some(point.clone());
        self.touch();
        Ok(point)
    }

    async fn full_resync<L: LocalInvalidation + ?Sized>(
        &mut self,
        local: &mut L,
        previous: Option<SyncPoint>,
        target: Option<SyncPoint>,
        cause: ResyncCause,
    ) -> Result<SyncOutcome> {
        let target = match target {
            Some(target) => target,
            None => {
                let point = SyncPoint::genesis();
                self.write_global(&point).await?;
                info!("Shared cache state missing or corrupt, started base {}", point.base);
                point
            }
        };

        let reason = InvalidationReason::FullResync(cause.clone());
        match &cause {
            ResyncCause::LogMissing { .. } | ResyncCause::VersionRollback => {
                warn!("Local cache dropped for {} ({})", target, reason)
            }
            _ => info!("Local cache dropped for {} ({})", target, reason),
        }

        if let Some(previous) = previous.filter(|p| p.base != target.base) {
            local.retire_base(&previous).await?;
        }
        local.invalidate_all(&target.base).await?;
        local.persist_state(&target).await?;

        self.state = Some(target.clone());
        self.touch();
        Ok(SyncOutcome::Full { target, cause })
    }

    /// Fetch logs `from + 1 ..= to`; `Err(version)` names the first missing one
    async fn fetch_logs(
        &self,
        base: &StateBase,
        from: u64,
        to: u64,
    ) -> Result<std::result::Result<Vec<ModificationLog>, u64>> {
        let keys: Vec<String> = (from + 1..=to)
            .map(|version| self.keys.log(base.as_str(), version))
            .collect();

        let mut fetched = self
            .backend
            .many(&keys)
            .await
            .map_err(|e| CacheError::SyncError(format!("failed to read logs: {}", e)))?;

        let mut logs = Vec::with_capacity(keys.len());
        for (version, key) in (from + 1..=to).zip(&keys) {
            match fetched.remove(key).flatten().and_then(decode_value::<ModificationLog>) {
                Some(log) => logs.push(log),
                None => return Ok(Err(version)),
            }
        }
        Ok(Ok(logs))
    }

    async fn read_base(&self) -> Result<Option<StateBase>> {
        let value = self
            .backend
            .get(&self.keys.base())
            .await
            .map_err(|e| CacheError::SyncError(format!("failed to read global base: {}", e)))?;

        Ok(match value {
            Some(Value::String(raw)) => {
                let base = StateBase::parse(&raw);
                if base.is_none() {
                    warn!("Ignoring malformed global base {:?}", raw);
                }
                base
            }
            _ => None,
        })
    }

    async fn read_global(&self) -> Result<Option<SyncPoint>> {
        let Some(base) = self.read_base().await? else {
            return Ok(None);
        };

        let value = self
            .backend
            .get(&self.keys.version(base.as_str()))
            .await
            .map_err(|e| CacheError::SyncError(format!("failed to read global version: {}", e)))?;

        let version = value.and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        });

        Ok(version
            .map(|version| SyncPoint::new(base, version))
            .filter(SyncPoint::is_valid))
    }

    async fn write_global(&self, point: &SyncPoint) -> Result<()> {
        // Version first, so a reader never sees a new base without its counter
        self.backend
            .set(
                &self.keys.version(point.base.as_str()),
                Value::from(point.version),
            )
            .await
            .map_err(|e| CacheError::SyncError(format!("failed to write global version: {}", e)))?;
        self.backend
            .set(&self.keys.base(), Value::String(point.base.as_str().to_string()))
            .await
            .map_err(|e| CacheError::SyncError(format!("failed to write global base: {}", e)))
    }
}

/// Decode a backend value that is either JSON or a string holding JSON
fn decode_value<T: DeserializeOwned>(value: Value) -> Option<T> {
    match value {
        Value::String(raw) => serde_json::from_str(&raw).ok(),
        other => serde_json::from_value(other).ok(),
    }
}
