//! # Local-First Synchronized Cache
//!
//! Each participant keeps its cache in local files and only talks to the
//! shared backend to learn which keys other participants have changed.
//!
//! ## Features
//!
//! - **Local Reads**: Records live on disk (optionally buffered in memory), never in the backend
//! - **Incremental Invalidation**: Per-version modification logs evict only keys whose hash changed
//! - **Safe Fallback**: Unknown epochs, rollbacks, lost logs and long gaps drop the local cache
//! - **TTL Expiration**: Records expire per key; refreshes are gated by a local TTL
//! - **Cross-Process Locking**: Advisory file locks guard state and per-key writes
//!
//! ## Architecture
//!
//! - `local`: sharded file store with atomic writes and file locks
//! - `sync`: reconciliation and publish protocol against the shared backend
//! - `store`: the public cache operations
//!
//! ## Example
//!
//! ```no_run
//! use ouroboros_cache::{CacheConfig, InMemoryBackend, SyncedCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .path("/var/cache/app")
//!     .local_ttl(Duration::from_secs(5))
//!     .build();
//!
//! let cache = SyncedCache::new(config, Arc::new(InMemoryBackend::new())).await?;
//!
//! cache.put("user:42", "Ada", Duration::from_secs(3600)).await?;
//!
//! if let Some(name) = cache.get::<String>("user:42").await? {
//!     println!("Cache hit: {}", name);
//! }
//!
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod local;
pub mod store;
pub mod sync;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::CacheRecord;
pub use invalidation::{InvalidationReason, ResyncCause};
pub use local::{FileLock, LocalBlobStore};
pub use store::{LifecycleEvent, SyncedCache};
pub use sync::{LocalInvalidation, StateSynchronizer, SyncOutcome};
pub use types::{
    CacheKey, CacheStats, Invalidation, ModificationLog, StateBase, SyncPoint, ValueHash,
    DELETED_HASH,
};
