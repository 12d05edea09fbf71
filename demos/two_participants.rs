//! Two Participants Demo
//!
//! Runs two cache participants against one in-memory backend and shows a
//! write on one evicting the stale copy held by the other.
//!
//! Usage:
//!   cargo run --example two_participants
//!
//! Environment variables:
//!   SYNC_CACHE_PATH  - storage root (default: a directory under the system temp dir)
//!   SYNC_CACHE_*     - any other option read by `CacheConfig::from_env`
//!   RUST_LOG         - log filter (default: ouroboros_cache=debug)

use ouroboros_cache::{CacheConfig, InMemoryBackend, SharedStateBackend, SyncedCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ouroboros_cache=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let base_config = match CacheConfig::from_env() {
        Ok(config) => config,
        Err(_) => CacheConfig::builder()
            .path(std::env::temp_dir().join("ouroboros-cache-demo"))
            .build(),
    };

    let backend: Arc<dyn SharedStateBackend> = Arc::new(InMemoryBackend::new());

    let mut web_config = base_config.clone();
    web_config.identity = "web".to_string();
    web_config.local_ttl = Duration::from_millis(500);
    let mut worker_config = base_config;
    worker_config.identity = "worker".to_string();

    let web = SyncedCache::new(web_config, backend.clone()).await?;
    let worker = SyncedCache::new(worker_config, backend).await?;

    info!("=== Two participants, one backend ===");

    web.forever("x", &12).await?;
    web.forever("y", &23).await?;
    info!("web wrote x=12, y=23");

    worker.forever("x", &1).await?;
    info!("worker wrote x=1");

    info!(
        "web inside its refresh window: x={:?}",
        web.get::<i32>("x").await?
    );

    tokio::time::sleep(Duration::from_millis(600)).await;

    info!("web after refresh: x={:?}", web.get::<i32>("x").await?);
    info!("web after refresh: y={:?}", web.get::<i32>("y").await?);

    assert_eq!(worker.increment("y", 5).await?, 5);
    web.refresh_local(true).await?;
    info!("web after worker incremented y: y={:?}", web.get::<i32>("y").await?);

    web.flush().await?;
    worker.refresh_local(true).await?;
    info!("flushed, worker now sees x={:?}", worker.get::<i32>("x").await?);

    info!("web {}", web.stats().await);
    info!("worker {}", worker.stats().await);

    Ok(())
}
