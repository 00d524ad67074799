//! Envelope written around every value the locking cache stores

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::DomainError;

/// Timestamped wrapper for a cached payload or a lock token
///
/// The logical TTL lives inside the envelope so that a value can still be
/// read (and served as stale) after it has logically expired, for as long
/// as the backend keeps it around.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEnvelope<T> {
    /// Unix timestamp (seconds) at write time
    pub stored_at: u64,
    /// Logical lifetime in seconds
    pub ttl: u64,
    pub payload: T,
}

/// Wire shape used for decoding; every field must be present
#[derive(Deserialize)]
struct RawEnvelope {
    stored_at: u64,
    ttl: u64,
    payload: serde_json::Value,
}

impl<T> CacheEnvelope<T> {
    pub fn new(payload: T, stored_at: u64, ttl: u64) -> Self {
        Self {
            stored_at,
            ttl,
            payload,
        }
    }

    /// Expired once `ttl` whole seconds have elapsed since `stored_at`
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.stored_at) >= self.ttl
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> CacheEnvelope<T> {
    pub fn encode(&self) -> Result<String, DomainError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> CacheEnvelope<T> {
    /// Decodes an envelope, failing on partial envelopes or payloads of the wrong type
    pub fn decode(raw: &str) -> Result<Self, DomainError> {
        let envelope: RawEnvelope = serde_json::from_str(raw)?;
        let payload = serde_json::from_value(envelope.payload)?;

        Ok(Self {
            stored_at: envelope.stored_at,
            ttl: envelope.ttl,
            payload,
        })
    }
}
