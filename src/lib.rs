//! # Ouroboros Cache (ouroboros-cache)
//!
//! A local-first cache with eventual coherence across processes and hosts.
//!
//! ## Features
//!
//! - File-backed cache per participant, with optional in-memory buffering
//! - Versioned global state in a pluggable shared backend
//! - Incremental catch-up from per-version modification logs
//! - Full local invalidation whenever state cannot be reconciled
//! - Async-first design using tokio
//!
//! ## Quick Start
//!
//! Two participants sharing one backend: a write on one evicts the stale
//! copy held by the other on its next refresh.
//!
//! ```no_run
//! use ouroboros_cache::{CacheConfig, InMemoryBackend, SyncedCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(InMemoryBackend::new());
//!
//!     let web = SyncedCache::new(
//!         CacheConfig::builder().path("/tmp/cache-web").build(),
//!         backend.clone(),
//!     )
//!     .await?;
//!     let worker = SyncedCache::new(
//!         CacheConfig::builder().path("/tmp/cache-worker").build(),
//!         backend,
//!     )
//!     .await?;
//!
//!     web.put("x", &12, Duration::ZERO).await?;
//!     worker.put("x", &13, Duration::ZERO).await?;
//!
//!     web.refresh_local(true).await?;
//!     assert_eq!(web.get::<i32>("x").await?, None);
//!     Ok(())
//! }
//! ```
//!
//! ## Shared Backend
//!
//! Implement [`SharedStateBackend`] over any store offering get, set, atomic
//! increment and batched reads. [`InMemoryBackend`] covers tests and
//! participants living in one process.

pub mod backend;
pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use backend::{InMemoryBackend, SharedStateBackend, StateKeys};
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheKey, CacheRecord, CacheStats, FileLock, Invalidation,
    InvalidationReason, LifecycleEvent, LocalBlobStore, LocalInvalidation, ResyncCause,
    StateBase, StateSynchronizer, SyncOutcome, SyncPoint, SyncedCache, ValueHash,
};
pub use error::{CacheError, Result};
