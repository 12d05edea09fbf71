//! Cache invalidation reasons and modification log merging
//!
//! Local records disappear for one of a few reasons:
//! - TTL-based: the record expired
//! - Explicit: forget, increment or decrement on this participant
//! - Log-driven: another participant published a different hash for the key
//! - Full resync: local state could not be reconciled incrementally

use crate::cache::types::{CacheKey, ModificationLog, ValueHash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a full local invalidation was required
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResyncCause {
    /// Global base differs from the local one
    UnknownBase,

    /// Global version is behind the local version
    VersionRollback,

    /// No usable local state (first use, corrupt or forced)
    Unsynced,

    /// Global state was absent or corrupt and a new epoch was minted
    BackendReset,

    /// Too many versions behind to replay
    CatchupLimitExceeded { gap: u64 },

    /// A modification log in the catch-up range was missing or malformed
    LogMissing { version: u64 },
}

impl std::fmt::Display for ResyncCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResyncCause::UnknownBase => write!(f, "unknown base"),
            ResyncCause::VersionRollback => write!(f, "version rollback"),
            ResyncCause::Unsynced => write!(f, "no local state"),
            ResyncCause::BackendReset => write!(f, "shared state reset"),
            ResyncCause::CatchupLimitExceeded { gap } => {
                write!(f, "{} versions behind", gap)
            }
            ResyncCause::LogMissing { version } => {
                write!(f, "log for version {} unavailable", version)
            }
        }
    }
}

/// Reason a local record was removed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Record expired based on TTL
    Expired,

    /// Explicit forget on this participant
    Forgotten,

    /// Another participant published a different value hash
    Modified,

    /// Whole local cache dropped
    FullResync(ResyncCause),

    /// Global flush
    Flush,

    /// Local-only clear
    LocalFlush,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::Forgotten => write!(f, "forgotten"),
            InvalidationReason::Modified => write!(f, "modified elsewhere"),
            InvalidationReason::FullResync(cause) => write!(f, "full resync: {}", cause),
            InvalidationReason::Flush => write!(f, "global flush"),
            InvalidationReason::LocalFlush => write!(f, "local flush"),
        }
    }
}

/// Merge logs in version order into `key -> last published hash`
///
/// Later versions overwrite earlier ones, and within one log later pairs
/// overwrite earlier pairs.
pub fn merge_logs<'a, I>(logs: I) -> HashMap<CacheKey, ValueHash>
where
    I: IntoIterator<Item = &'a ModificationLog>,
{
    let mut merged = HashMap::new();
    for log in logs {
        for invalidation in log {
            merged.insert(invalidation.0.clone(), invalidation.1.clone());
        }
    }
    merged
}

/// Decide whether a local copy survives a merged log entry
///
/// A key that was logged is kept only when the local copy exists and carries
/// exactly the published hash.
pub fn should_evict(local: Option<&ValueHash>, published: &ValueHash) -> bool {
    match local {
        Some(hash) => hash != published,
        None => true,
    }
}
