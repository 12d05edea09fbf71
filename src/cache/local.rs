//! File-backed local store for one participant identity
//!
//! Layout under `<path>/<identity>`:
//!
//! ```text
//! state.json              last applied sync point
//! state.lock              state lock
//! <base>/ab/cd/<h>.json   cached records, sharded by key digest
//! locks/ab/cd/<h>.lock    per-key locks, outside every base scope
//! gc/<base>               retired base marker holding its last version
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so
//! readers never observe a partially written record or state file.

use crate::cache::config::CacheConfig;
use crate::cache::types::{StateBase, SyncPoint};
use crate::error::{CacheError, Result};
use fs4::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";
const STATE_LOCK: &str = "state.lock";
const LOCKS_DIR: &str = "locks";
const GC_DIR: &str = "gc";

/// Exclusive advisory lock held until dropped
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Durable key to bytes storage local to a host
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    file_permission: Option<u32>,
    directory_permission: Option<u32>,
}

impl LocalBlobStore {
    /// Create a store rooted at `root`; nothing is touched on disk yet
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_permission: None,
            directory_permission: None,
        }
    }

    /// Create the store for a configured identity
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            root: config.identity_dir(),
            file_permission: config.file_permission,
            directory_permission: config.directory_permission,
        }
    }

    /// Set unix permission bits applied to new files and directories
    pub fn with_permissions(mut self, file: Option<u32>, directory: Option<u32>) -> Self {
        self.file_permission = file;
        self.directory_permission = directory;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory
    pub async fn ensure_root(&self) -> Result<()> {
        self.ensure_dir(&self.root).await
    }

    /// Path of a record file for `key` within `scope`
    pub fn record_path(&self, scope: &StateBase, key: &str) -> PathBuf {
        let digest = key_digest(key);
        shard(&self.root.join(scope.as_str()), &digest).join(format!("{}.json", digest))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let digest = key_digest(key);
        shard(&self.root.join(LOCKS_DIR), &digest).join(format!("{}.lock", digest))
    }

    /// Read a record's bytes, `None` when absent
    pub async fn get(&self, scope: &StateBase, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(scope, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::storage(path, e)),
        }
    }

    /// Write a record's bytes atomically
    pub async fn put(&self, scope: &StateBase, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.record_path(scope, key);
        self.write_atomic(&path, bytes).await
    }

    /// Remove a record, returning whether it existed
    pub async fn delete(&self, scope: &StateBase, key: &str) -> Result<bool> {
        let path = self.record_path(scope, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::storage(path, e)),
        }
    }

    /// Remove every record within `scope`
    pub async fn clear(&self, scope: &StateBase) -> Result<()> {
        let dir = self.root.join(scope.as_str());
        let mut attempts = 0;
        loop {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    debug!("Cleared local scope {}", scope);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                // A concurrent writer may add files while the tree is removed
                Err(_) if attempts < 3 => attempts += 1,
                Err(e) => return Err(CacheError::storage(dir, e)),
            }
        }
    }

    /// Load the persisted sync point
    ///
    /// Missing, unreadable-as-JSON or partial state all count as unsynced.
    pub async fn load_state(&self) -> Result<Option<SyncPoint>> {
        let path = self.root.join(STATE_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let point = SyncPoint::decode(&bytes);
                if point.is_none() {
                    warn!("Ignoring corrupt local sync state at {}", path.display());
                }
                Ok(point)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::storage(path, e)),
        }
    }

    /// Persist the sync point
    pub async fn persist_state(&self, point: &SyncPoint) -> Result<()> {
        let bytes = serde_json::to_vec(point)?;
        self.write_atomic(&self.root.join(STATE_FILE), &bytes).await
    }

    /// Record that `point.base` was abandoned at `point.version`
    ///
    /// Orphaned records of a retired base stay on disk for an external
    /// reclaimer; see [`LocalBlobStore::retired_scopes`].
    pub async fn retire_scope(&self, point: &SyncPoint) -> Result<()> {
        let path = self.root.join(GC_DIR).join(point.base.as_str());
        self.write_atomic(&path, point.version.to_string().as_bytes())
            .await
    }

    /// List retired bases with the last version applied under each
    pub async fn retired_scopes(&self) -> Result<Vec<SyncPoint>> {
        let dir = self.root.join(GC_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::storage(dir, e)),
        };

        let mut retired = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::storage(&dir, e))?
        {
            let name = entry.file_name();
            let Some(base) = name.to_str().and_then(StateBase::parse) else {
                continue;
            };
            // Temp files from an interrupted write start with a dot
            if base.as_str().starts_with('.') {
                continue;
            }

            let version = tokio::fs::read_to_string(entry.path())
                .await
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .unwrap_or(0);
            retired.push(SyncPoint::new(base, version));
        }

        retired.sort_by(|a, b| a.base.as_str().cmp(b.base.as_str()));
        Ok(retired)
    }

    /// Take the per-identity state lock
    pub async fn lock_state(&self) -> Result<FileLock> {
        self.lock_exclusive(self.root.join(STATE_LOCK)).await
    }

    /// Take the lock guarding writes of one key
    pub async fn lock_record(&self, key: &str) -> Result<FileLock> {
        self.lock_exclusive(self.lock_path(key)).await
    }

    /// Block until an exclusive lock on `path` is held
    ///
    /// The lock file is created if needed and never removed.
    pub async fn lock_exclusive(&self, path: PathBuf) -> Result<FileLock> {
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent).await?;
        }

        tokio::task::spawn_blocking(move || {
            let file = match OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(source) => return Err(CacheError::LockError { path, source }),
            };

            match FileExt::lock_exclusive(&file) {
                Ok(()) => Ok(FileLock { file, path }),
                Err(source) => Err(CacheError::LockError { path, source }),
            }
        })
        .await
        .map_err(|e| CacheError::Other(format!("lock task failed: {}", e)))?
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(CacheError::Other(format!(
                "invalid record path {}",
                path.display()
            )));
        };
        self.ensure_dir(dir).await?;

        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CacheError::storage(&tmp, e))?;
        self.apply_mode(&tmp, self.file_permission).await?;

        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::storage(path, e));
        }
        Ok(())
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            return Ok(());
        }

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::storage(dir, e))?;

        if self.directory_permission.is_some() {
            // Only the directories this store owns get their mode changed
            let mut current = Some(dir);
            while let Some(path) = current {
                if !path.starts_with(&self.root) {
                    break;
                }
                self.apply_mode(path, self.directory_permission).await?;
                if path == self.root {
                    break;
                }
                current = path.parent();
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn apply_mode(&self, path: &Path, mode: Option<u32>) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = mode {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| CacheError::storage(path, e))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn apply_mode(&self, _path: &Path, _mode: Option<u32>) -> Result<()> {
        Ok(())
    }
}

fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn shard(dir: &Path, digest: &str) -> PathBuf {
    dir.join(&digest[0..2]).join(&digest[2..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalBlobStore {
        LocalBlobStore::new(dir.path().join("default"))
    }

    #[tokio::test]
    async fn test_record_layout_is_sharded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let base = StateBase::parse("b1").unwrap();

        let path = store.record_path(&base, "x");
        let digest = key_digest("x");
        let expected = dir
            .path()
            .join("default")
            .join("b1")
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(format!("{}.json", digest));

        assert_eq!(path, expected);
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let base = StateBase::parse("b1").unwrap();

        assert!(store.get(&base, "x").await.unwrap().is_none());

        store.put(&base, "x", b"12").await.unwrap();
        assert_eq!(store.get(&base, "x").await.unwrap().unwrap(), b"12");

        store.put(&base, "x", b"13").await.unwrap();
        assert_eq!(store.get(&base, "x").await.unwrap().unwrap(), b"13");

        assert!(store.delete(&base, "x").await.unwrap());
        assert!(!store.delete(&base, "x").await.unwrap());
        assert!(store.get(&base, "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_only_touches_one_scope() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let old = StateBase::parse("old").unwrap();
        let new = StateBase::parse("new").unwrap();

        store.put(&old, "x", b"1").await.unwrap();
        store.put(&new, "x", b"2").await.unwrap();
        store.clear(&old).await.unwrap();
        store.clear(&old).await.unwrap();

        assert!(store.get(&old, "x").await.unwrap().is_none());
        assert_eq!(store.get(&new, "x").await.unwrap().unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_state_round_trip_and_corruption() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.load_state().await.unwrap().is_none());

        let point = SyncPoint::new(StateBase::parse("b1").unwrap(), 4);
        store.persist_state(&point).await.unwrap();
        assert_eq!(store.load_state().await.unwrap(), Some(point));

        tokio::fs::write(store.root().join(STATE_FILE), br#"{"base":"b1"}"#)
            .await
            .unwrap();
        assert!(store.load_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retired_scopes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.retired_scopes().await.unwrap().is_empty());

        store
            .retire_scope(&SyncPoint::new(StateBase::parse("b2").unwrap(), 9))
            .await
            .unwrap();
        store
            .retire_scope(&SyncPoint::new(StateBase::parse("b1").unwrap(), 3))
            .await
            .unwrap();

        let retired = store.retired_scopes().await.unwrap();
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[0].base.as_str(), "b1");
        assert_eq!(retired[0].version, 3);
        assert_eq!(retired[1].version, 9);
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let guard = store.lock_record("x").await.unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let store = store.clone();
            let acquired = acquired.clone();
            tokio::spawn(async move {
                let _guard = store.lock_record("x").await.unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(guard);
        waiter.await.unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lock_files_survive_scope_clear() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let base = StateBase::parse("b1").unwrap();

        let guard = store.lock_record("x").await.unwrap();
        store.put(&base, "x", b"1").await.unwrap();
        store.clear(&base).await.unwrap();

        assert!(guard.path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store(&dir).with_permissions(Some(0o600), Some(0o700));
        let base = StateBase::parse("b1").unwrap();

        store.put(&base, "x", b"1").await.unwrap();

        let path = store.record_path(&base, "x");
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
