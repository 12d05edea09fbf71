//! Cache record management with TTL support

use crate::cache::types::ValueHash;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value as persisted in the local store
///
/// The value is kept in its serialized JSON form so that its hash stays
/// stable across reads and rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Serialized value
    pub value: String,

    /// When the record expires; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

/// Serialize through `serde_json::Value`, whose maps keep keys sorted, so
/// equal maps always produce the same bytes
fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::to_value(value)?)?)
}

impl CacheRecord {
    /// Serialize a value into a record; a zero TTL never expires
    pub fn new<T: Serialize + ?Sized>(value: &T, ttl: Duration) -> Result<Self> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| CacheError::Other(format!("TTL out of range: {}", e)))?;
            Some(Utc::now() + ttl)
        };

        Ok(Self {
            value: canonical_json(value)?,
            expires_at,
        })
    }

    /// Create a record with an explicit expiration time
    pub fn with_expiration<T: Serialize + ?Sized>(
        value: &T,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        Ok(Self {
            value: canonical_json(value)?,
            expires_at,
        })
    }

    /// Check if the record has expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }

    /// Get time until expiration (`None` once expired or for records that never expire)
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let expires_at = self.expires_at?;
        let now = Utc::now();
        if now > expires_at {
            None
        } else {
            (expires_at - now).to_std().ok()
        }
    }

    /// Hash of the serialized value, as published to other participants
    pub fn value_hash(&self) -> ValueHash {
        ValueHash::of(self.value.as_bytes())
    }

    /// Decode the stored value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.value)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
