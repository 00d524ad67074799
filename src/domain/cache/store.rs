//! Key/value store trait consumed by the locking cache

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::DomainError;

#[cfg(test)]
use mockall::automock;

/// Shared key/value backend with per-key TTL and no native locking
///
/// Values are opaque strings (the locking cache writes JSON envelopes).
/// Every operation is expected to be atomic per key; nothing more is assumed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync + Debug {
    /// Gets a raw value, `None` on miss
    async fn get_raw(&self, key: &str) -> Result<Option<String>, DomainError>;

    /// Gets many raw values at once; keys missing from the map are misses
    async fn get_many_raw(&self, keys: &[String]) -> Result<HashMap<String, String>, DomainError> {
        let mut found = HashMap::with_capacity(keys.len());

        for key in keys {
            if let Some(value) = self.get_raw(key).await? {
                found.insert(key.clone(), value);
            }
        }

        Ok(found)
    }

    /// Sets a raw value with a backend-level TTL
    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DomainError>;

    /// Deletes a key, returning whether anything was removed
    async fn delete(&self, key: &str) -> Result<bool, DomainError>;

    /// TTL applied when callers do not supply one
    fn default_ttl(&self) -> Duration;
}
