//! Core type definitions for the synchronized cache

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Cache key type
pub type CacheKey = String;

/// Sentinel hash published for deleted keys
pub const DELETED_HASH: &str = "-1";

/// Digest of a value's serialized form
///
/// Two writes of the same serialized bytes produce the same hash, which lets
/// other participants skip evicting a copy they already hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueHash(String);

impl ValueHash {
    /// Hash serialized value bytes
    pub fn of(bytes: &[u8]) -> Self {
        ValueHash(hex::encode(Sha256::digest(bytes)))
    }

    /// The sentinel meaning "deleted"
    pub fn deleted() -> Self {
        ValueHash(DELETED_HASH.to_string())
    }

    pub fn is_deleted(&self) -> bool {
        self.0 == DELETED_HASH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValueHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Longest accepted base identifier
pub const MAX_BASE_LEN: usize = 64;

/// Directory names under the storage root that are not base scopes
const RESERVED_BASES: [&str; 2] = ["locks", "gc"];

/// Opaque identifier of a global state epoch
///
/// Bases name directories under the storage root, so only ASCII
/// alphanumerics and `-` are accepted, up to [`MAX_BASE_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateBase(String);

impl StateBase {
    /// Mint a fresh, globally unique base
    pub fn generate() -> Self {
        StateBase(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier, rejecting anything that is not a plain
    /// directory name
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if Self::is_well_formed(raw) {
            Some(StateBase(raw.to_string()))
        } else {
            None
        }
    }

    fn is_well_formed(raw: &str) -> bool {
        !raw.is_empty()
            && raw.len() <= MAX_BASE_LEN
            && raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !RESERVED_BASES.contains(&raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `(base, version)` pair
///
/// Used both for the global state held by the shared backend and for the
/// state a participant has fully applied locally. A version of 0 is never a
/// valid sync point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub base: StateBase,
    pub version: u64,
}

impl SyncPoint {
    pub fn new(base: StateBase, version: u64) -> Self {
        Self { base, version }
    }

    /// First version of a freshly minted epoch
    pub fn genesis() -> Self {
        Self::new(StateBase::generate(), 1)
    }

    pub fn is_valid(&self) -> bool {
        self.version > 0 && StateBase::is_well_formed(self.base.as_str())
    }

    /// Decode a persisted sync point; anything partial or malformed is `None`
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice::<SyncPoint>(bytes)
            .ok()
            .filter(SyncPoint::is_valid)
    }
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.base, self.version)
    }
}

/// One modified key and the hash of its new value
///
/// Serialized as a two-element array `[key, hash]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation(pub CacheKey, pub ValueHash);

impl Invalidation {
    pub fn written(key: impl Into<CacheKey>, hash: ValueHash) -> Self {
        Invalidation(key.into(), hash)
    }

    pub fn deleted(key: impl Into<CacheKey>) -> Self {
        Invalidation(key.into(), ValueHash::deleted())
    }

    pub fn key(&self) -> &str {
        &self.0
    }

    pub fn hash(&self) -> &ValueHash {
        &self.1
    }
}

/// All keys written in one version
pub type ModificationLog = Vec<Invalidation>;

/// Statistics for a single participant
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Reads answered from the local cache
    pub hits: u64,

    /// Reads that found nothing usable
    pub misses: u64,

    /// Reads answered from the in-memory buffer without touching disk
    pub buffer_hits: u64,

    /// Records written locally
    pub writes: u64,

    /// Records removed because they expired
    pub evictions_ttl: u64,

    /// Records removed by forget, increment or incremental catch-up
    pub invalidations: u64,

    /// Reconciliations resolved by log replay
    pub incremental_syncs: u64,

    /// Reconciliations that cleared the whole local cache
    pub full_syncs: u64,

    /// Versions published to the shared backend
    pub publishes: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Total reconciliations that changed local state
    pub fn total_syncs(&self) -> u64 {
        self.incremental_syncs + self.full_syncs
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, writes: {}, publishes: {}, syncs: {} incremental / {} full }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.writes,
            self.publishes,
            self.incremental_syncs,
            self.full_syncs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_hash_is_deterministic() {
        let a = ValueHash::of(b"12");
        let b = ValueHash::of(b"12");
        let c = ValueHash::of(b"13");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.is_deleted());
    }

    #[test]
    fn test_deleted_sentinel() {
        let deleted = ValueHash::deleted();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.as_str(), "-1");
        assert_ne!(deleted, ValueHash::of(b"-1"));
    }

    #[test]
    fn test_state_base_generation() {
        let a = StateBase::generate();
        let b = StateBase::generate();
        assert_ne!(a, b);

        assert!(StateBase::parse("   ").is_none());
        assert_eq!(StateBase::parse("abc").unwrap().as_str(), "abc");
        assert_eq!(StateBase::parse(a.as_str()), Some(a.clone()));
    }

    #[test]
    fn test_state_base_rejects_non_directory_names() {
        assert!(StateBase::parse("b1").is_some());
        assert!(StateBase::parse(&"a".repeat(MAX_BASE_LEN)).is_some());

        for raw in [
            "../x",
            "/tmp/x",
            "state.json",
            "locks",
            "gc",
            "a/b",
            ".",
            "..",
            "x y",
            "base_1",
        ] {
            assert!(StateBase::parse(raw).is_none(), "accepted {:?}", raw);
        }
        assert!(StateBase::parse(&"a".repeat(MAX_BASE_LEN + 1)).is_none());
    }

    #[test]
    fn test_sync_point_decode_rejects_partial_state() {
        let valid = br#"{"base":"b1","version":3}"#;
        let point = SyncPoint::decode(valid).unwrap();
        assert_eq!(point.version, 3);
        assert_eq!(point.base.as_str(), "b1");

        assert!(SyncPoint::decode(br#"{"base":"b1"}"#).is_none());
        assert!(SyncPoint::decode(br#"{"version":3}"#).is_none());
        assert!(SyncPoint::decode(br#"{"base":"b1","version":0}"#).is_none());
        assert!(SyncPoint::decode(br#"{"base":"","version":2}"#).is_none());
        assert!(SyncPoint::decode(br#"{"base":"../b1","version":2}"#).is_none());
        assert!(SyncPoint::decode(b"garbage").is_none());
    }

    #[test]
    fn test_invalidation_wire_shape() {
        let inv = Invalidation::deleted("x");
        let json = serde_json::to_value(&inv).unwrap();
        assert_eq!(json, serde_json::json!(["x", "-1"]));

        let parsed: Invalidation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.key(), "x");
        assert!(parsed.hash().is_deleted());
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };

        assert_eq!(stats.hit_rate(), 80.0);
        assert_eq!(stats.miss_rate(), 20.0);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            hits: 100,
            misses: 50,
            publishes: 7,
            incremental_syncs: 3,
            full_syncs: 1,
            ..Default::default()
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("publishes: 7"));
        assert_eq!(stats.total_syncs(), 4);
    }
}
