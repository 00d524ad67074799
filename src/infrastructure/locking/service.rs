//! Locking cache service
//!
//! Wraps a [`KeyValueStore`] with lock-gated writes and stampede-safe
//! get-or-compute:
//! - fresh values are served directly
//! - expired values are still served while someone else holds the key's lock
//! - otherwise the caller takes the lock, runs the producer and persists the result
//!
//! Locks are plain store entries (`lock_prefix + key`) holding a random token.
//! Acquisition is read-then-write, not compare-and-swap, so two callers racing on
//! an unlocked key can both win. The goal is fewer duplicate recomputations, not
//! strict mutual exclusion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::cache::{CacheEnvelope, Clock, KeyValueStore, SystemClock};
use crate::domain::DomainError;
use crate::infrastructure::observability::{
    record_lock, record_lookup, record_producer_run, record_rejected_write, LockOutcome,
    LookupOutcome,
};

use super::config::LockingCacheConfig;
use super::lock_table::LockTable;

/// Polling interval while waiting for a contended lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stampede-protecting cache over a shared store
///
/// One instance may be shared between tasks; its lock table is mutex-guarded.
#[derive(Debug)]
pub struct LockingCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: LockingCacheConfig,
    locks: LockTable,
}

impl LockingCache {
    /// Creates a locking cache using the system clock
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: LockingCacheConfig,
    ) -> Result<Self, DomainError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates a locking cache with an explicit time source
    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        config: LockingCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        config.validate()?;

        Ok(Self {
            store,
            clock,
            config,
            locks: LockTable::new(),
        })
    }

    pub fn config(&self) -> &LockingCacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of locks this instance currently believes it holds
    pub fn held_lock_count(&self) -> usize {
        self.locks.len()
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.config.lock_prefix, key)
    }

    /// Reads and decodes an envelope; store failures and malformed data are misses
    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEnvelope<T>> {
        let raw = match self.store.get_raw(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Store read failed, treating as miss");
                return None;
            }
        };

        match CacheEnvelope::decode(&raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Ignoring malformed envelope");
                None
            }
        }
    }

    /// Token of the live lock on `key`, if any
    ///
    /// A lock record that is logically expired counts as released even when the
    /// store still returns it.
    pub async fn current_lock(&self, key: &str) -> Option<u64> {
        if !self.config.enabled {
            return None;
        }

        let envelope = self.fetch::<u64>(&self.lock_key(key)).await?;

        if envelope.is_expired(self.clock.now_secs()) {
            None
        } else {
            Some(envelope.into_payload())
        }
    }

    /// Whether anyone (this instance included) holds the lock on `key`
    pub async fn is_locked(&self, key: &str) -> bool {
        self.current_lock(key).await.is_some()
    }

    fn owns(&self, lock_key: &str, current: Option<u64>) -> bool {
        current.is_some() && self.locks.get(lock_key) == current
    }

    /// Tries to become the exclusive writer for `key`
    ///
    /// A lock this instance already holds is refreshed with a new token. When the
    /// lock belongs to someone else, polls every 50ms for up to `timeout`
    /// (zero means a single attempt).
    pub async fn acquire_lock(&self, key: &str, ttl: Option<Duration>, timeout: Duration) -> bool {
        if !self.config.enabled {
            return true;
        }

        let lock_key = self.lock_key(key);
        let ttl = ttl.unwrap_or(self.config.lock_time);

        let mut current = self.current_lock(key).await;
        let mut mine = self.owns(&lock_key, current);

        if current.is_some() && !mine && !timeout.is_zero() {
            let started = self.clock.now_millis();
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

            tracing::debug!(key = %key, timeout_ms, "Waiting for lock");

            while current.is_some()
                && !mine
                && self.clock.now_millis().saturating_sub(started) < timeout_ms
            {
                self.clock.sleep(LOCK_POLL_INTERVAL).await;
                current = self.current_lock(key).await;
                mine = self.owns(&lock_key, current);
            }
        }

        if current.is_some() && !mine {
            tracing::debug!(key = %key, "Lock held by another party");
            record_lock(LockOutcome::Contended);
            return false;
        }

        let token: u64 = rand::random();
        // Sub-second TTLs would produce records that are expired on arrival
        let ttl_secs = ttl.as_secs().max(1);
        let envelope = CacheEnvelope::new(token, self.clock.now_secs(), ttl_secs);

        let written = match envelope.encode() {
            Ok(raw) => self
                .store
                .set_raw(&lock_key, &raw, Duration::from_secs(ttl_secs))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match written {
            Ok(()) => {
                self.locks.insert(lock_key, token);
                tracing::debug!(key = %key, ttl_secs, refreshed = mine, "Lock acquired");
                record_lock(LockOutcome::Acquired);
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to write lock record");
                record_lock(LockOutcome::StoreError);
                false
            }
        }
    }

    /// Whether this instance still holds the lock on `key`
    ///
    /// Verified against the store; a lost lock (expired, or taken over by
    /// someone else) is dropped from the local table.
    pub async fn has_lock(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        let lock_key = self.lock_key(key);
        let Some(token) = self.locks.get(&lock_key) else {
            return false;
        };

        if self.current_lock(key).await == Some(token) {
            return true;
        }

        tracing::debug!(key = %key, "Lock lost since acquisition");
        self.locks.remove_if(&lock_key, token);
        false
    }

    /// Releases the lock on `key`
    ///
    /// Without `force`, only the holder can release. Releasing a key nobody has
    /// locked succeeds, so double release is harmless. If the store delete fails
    /// the lock stays in place and `false` is returned.
    pub async fn release_lock(&self, key: &str, force: bool) -> bool {
        if !self.config.enabled {
            return true;
        }

        let lock_key = self.lock_key(key);
        let current = self.current_lock(key).await;

        if !force && !self.owns(&lock_key, current) {
            if let Some(stale) = self.locks.get(&lock_key) {
                tracing::debug!(key = %key, "Dropping stale local lock entry");
                self.locks.remove_if(&lock_key, stale);
            }

            return current.is_none();
        }

        if let Err(e) = self.store.delete(&lock_key).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete lock record");
            return false;
        }

        self.locks.remove(&lock_key);
        tracing::debug!(key = %key, force, "Lock released");
        true
    }

    /// Returns a usable cached value, waiting for an in-flight refresh if needed
    ///
    /// `None` means nothing fresh is cached and nobody is refreshing it, or the
    /// retry budget ran out while the key stayed locked.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }

        self.lookup(key).await
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut envelope = self.fetch::<T>(key).await;
        let mut attempt = 0;

        loop {
            match envelope {
                Some(found) => {
                    if !found.is_expired(self.clock.now_secs()) {
                        record_lookup(LookupOutcome::Hit);
                        return Some(found.into_payload());
                    }

                    if self.is_locked(key).await {
                        tracing::debug!(key = %key, "Serving stale value during refresh");
                        record_lookup(LookupOutcome::Stale);
                        return Some(found.into_payload());
                    }

                    record_lookup(LookupOutcome::Miss);
                    return None;
                }
                None => {
                    if !self.is_locked(key).await {
                        record_lookup(LookupOutcome::Miss);
                        return None;
                    }
                }
            }

            if attempt >= self.config.retry_count {
                tracing::debug!(key = %key, attempts = attempt, "Gave up waiting for locked key");
                record_lookup(LookupOutcome::GaveUp);
                return None;
            }

            attempt += 1;
            self.clock.sleep(self.config.retry_sleep).await;
            envelope = self.fetch::<T>(key).await;
        }
    }

    /// Returns the cached value or computes, stores and returns a new one
    ///
    /// The producer runs whenever no usable value exists. Its result is
    /// persisted only if the lock could be taken, so a caller that lost the
    /// race never overwrites the real refresher. Producer errors propagate
    /// unchanged and release the lock.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return producer().await;
        }

        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        let ttl = ttl.unwrap_or_else(|| self.store.default_ttl());
        let locked = self.acquire_lock(key, None, Duration::ZERO).await;

        let result = producer().await;

        if !locked {
            tracing::debug!(key = %key, "Lock held elsewhere, returning result without storing");
            record_producer_run(false);
            return result;
        }

        match &result {
            Ok(value) => {
                let stored = self.set(key, value, Some(ttl)).await;
                record_producer_run(stored);
            }
            Err(_) => {
                tracing::debug!(key = %key, "Producer failed, releasing lock");
                record_producer_run(false);
            }
        }

        self.release_lock(key, false).await;
        result
    }

    /// Stores `value` under `key`, but only while holding its lock
    ///
    /// The TTL is rounded up to at least one second. The backend TTL is
    /// `ttl + ttl_buffer` so the value stays readable as stale for a while
    /// after it logically expires.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        if !self.config.enabled {
            return true;
        }

        if !self.has_lock(key).await {
            tracing::debug!(key = %key, "Rejecting write without lock");
            record_rejected_write();
            return false;
        }

        let ttl = ttl.unwrap_or_else(|| self.store.default_ttl());
        // Same whole-second floor as lock records
        let ttl_secs = ttl.as_secs().max(1);
        let envelope = CacheEnvelope::new(value, self.clock.now_secs(), ttl_secs);

        let raw = match envelope.encode() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode value");
                return false;
            }
        };

        let backend_ttl = Duration::from_secs(ttl_secs).saturating_add(self.config.ttl_buffer);

        match self.store.set_raw(key, &raw, backend_ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to store value");
                false
            }
        }
    }

    /// Fetches many keys in one round trip without locking or waiting
    ///
    /// Every requested key is present in the result; `None` marks a miss
    /// (absent, malformed or expired).
    pub async fn get_multiple<T: DeserializeOwned>(&self, keys: &[&str]) -> HashMap<String, Option<T>> {
        let mut results: HashMap<String, Option<T>> =
            keys.iter().map(|key| (key.to_string(), None)).collect();

        if !self.config.enabled || keys.is_empty() {
            return results;
        }

        let requested: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        let found = match self.store.get_many_raw(&requested).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(count = keys.len(), error = %e, "Batch read failed, treating as misses");
                return results;
            }
        };

        let now = self.clock.now_secs();

        for (key, raw) in found {
            let Some(slot) = results.get_mut(&key) else {
                continue;
            };

            match CacheEnvelope::<T>::decode(&raw) {
                Ok(envelope) if !envelope.is_expired(now) => *slot = Some(envelope.into_payload()),
                Ok(_) => {}
                Err(e) => tracing::debug!(key = %key, error = %e, "Ignoring malformed envelope"),
            }
        }

        results
    }

    /// Removes `key` from the store, leaving its lock untouched
    pub async fn del(&self, key: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        match self.store.delete(key).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to delete key");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cache::{ManualClock, MockKeyValueStore, MockStore};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: u64 = 1_700_000_000;

    fn config() -> LockingCacheConfig {
        LockingCacheConfig::default()
            .with_retry_count(3)
            .with_retry_sleep(Duration::from_millis(50))
            .with_lock_time(Duration::from_secs(5))
            .with_ttl_buffer(Duration::from_secs(10))
    }

    fn cache_with(
        store: &Arc<MockStore>,
        clock: &Arc<ManualClock>,
        config: LockingCacheConfig,
    ) -> LockingCache {
        LockingCache::with_clock(store.clone(), config, clock.clone()).unwrap()
    }

    fn setup() -> (Arc<MockStore>, Arc<ManualClock>, LockingCache) {
        let store = Arc::new(MockStore::new());
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let cache = cache_with(&store, &clock, config());
        (store, clock, cache)
    }

    fn raw_envelope<T: Serialize>(payload: T, stored_at: u64, ttl: u64) -> String {
        CacheEnvelope::new(payload, stored_at, ttl).encode().unwrap()
    }

    fn counting_producer(
        calls: Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<Result<String, Infallible>> {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value.to_string()))
        }
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MockStore::new());
        let result = LockingCache::new(store, LockingCacheConfig::default().with_lock_prefix(""));

        assert!(matches!(result, Err(DomainError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_acquire_writes_lock_record() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);

        let raw = store.raw("lock_k").expect("lock record written");
        let envelope: CacheEnvelope<u64> = CacheEnvelope::decode(&raw).unwrap();
        assert_eq!(envelope.stored_at, NOW);
        assert_eq!(envelope.ttl, 5);
        assert_eq!(store.backend_ttl("lock_k"), Some(Duration::from_secs(5)));
        assert!(cache.has_lock("k").await);
        assert_eq!(cache.current_lock("k").await, Some(envelope.payload));
    }

    #[tokio::test]
    async fn test_acquire_uses_explicit_ttl() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", Some(Duration::from_secs(42)), Duration::ZERO).await);
        assert_eq!(store.backend_ttl("lock_k"), Some(Duration::from_secs(42)));
    }

    #[tokio::test]
    async fn test_reacquire_own_lock_refreshes_token() {
        let (_store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        let first = cache.current_lock("k").await;

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        let second = cache.current_lock("k").await;

        assert!(second.is_some());
        assert_ne!(first, second);
        assert!(cache.has_lock("k").await);
        assert_eq!(cache.held_lock_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_fails_when_held_elsewhere() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);
        assert!(!b.acquire_lock("k", None, Duration::ZERO).await);
        assert!(!b.has_lock("k").await);
        assert!(a.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_acquire_times_out_after_polling() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", Some(Duration::from_secs(60)), Duration::ZERO).await);

        let started = clock.now_millis();
        assert!(!b.acquire_lock("k", None, Duration::from_millis(200)).await);

        let waited = clock.now_millis() - started;
        assert!(waited >= 200);
        assert!(waited < 200 + LOCK_POLL_INTERVAL.as_millis() as u64 + 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_out_expiring_lock() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", Some(Duration::from_secs(1)), Duration::ZERO).await);
        assert!(b.acquire_lock("k", None, Duration::from_secs(3)).await);
        assert!(b.has_lock("k").await);
        assert!(!a.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_acquire_fails_when_store_write_fails() {
        let (store, _clock, cache) = setup();
        store.set_error(Some("down".to_string()));

        assert!(!cache.acquire_lock("k", None, Duration::ZERO).await);
        assert_eq!(cache.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_lock_self_heals_after_ttl() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);
        assert!(!b.acquire_lock("k", None, Duration::ZERO).await);

        clock.advance(Duration::from_secs(5));

        assert!(!a.has_lock("k").await);
        assert!(b.acquire_lock("k", None, Duration::ZERO).await);
        assert!(b.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_has_lock_purges_after_takeover() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);
        clock.advance(Duration::from_secs(6));
        assert!(b.acquire_lock("k", None, Duration::ZERO).await);

        assert_eq!(a.held_lock_count(), 1);
        assert!(!a.has_lock("k").await);
        assert_eq!(a.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_has_lock_without_acquire() {
        let (_store, _clock, cache) = setup();
        assert!(!cache.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_release_twice_is_idempotent() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        assert!(cache.release_lock("k", false).await);
        assert!(store.raw("lock_k").is_none());
        assert!(cache.release_lock("k", false).await);
        assert!(!cache.is_locked("k").await);
    }

    #[tokio::test]
    async fn test_release_refuses_foreign_lock() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);
        assert!(!b.release_lock("k", false).await);
        assert!(a.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_force_release_removes_foreign_lock() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);
        assert!(b.release_lock("k", true).await);
        assert!(!a.is_locked("k").await);
        assert!(!a.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_release_with_stale_local_entry_reports_failure() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);
        clock.advance(Duration::from_secs(6));
        assert!(b.acquire_lock("k", None, Duration::ZERO).await);

        assert!(!a.release_lock("k", false).await);
        assert_eq!(a.held_lock_count(), 0);
        assert!(b.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_release_keeps_lock_when_delete_fails() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        store.set_fail_deletes(true);

        assert!(!cache.release_lock("k", false).await);
        assert!(cache.has_lock("k").await);

        store.set_fail_deletes(false);
        assert!(cache.release_lock("k", false).await);
        assert!(!cache.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_set_requires_lock() {
        let (store, _clock, cache) = setup();

        assert!(!cache.set("k", &"v", None).await);
        assert!(store.raw("k").is_none());
    }

    #[tokio::test]
    async fn test_set_wraps_value_and_extends_backend_ttl() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        assert!(cache.set("k", &"v", Some(Duration::from_secs(60))).await);

        let envelope: CacheEnvelope<String> = CacheEnvelope::decode(&store.raw("k").unwrap()).unwrap();
        assert_eq!(envelope, CacheEnvelope::new("v".to_string(), NOW, 60));
        assert_eq!(store.backend_ttl("k"), Some(Duration::from_secs(70)));
    }

    #[tokio::test]
    async fn test_set_defaults_to_store_ttl() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        assert!(cache.set("k", &1u32, None).await);

        assert_eq!(store.backend_ttl("k"), Some(Duration::from_secs(3600 + 10)));
    }

    #[tokio::test]
    async fn test_set_rounds_sub_second_ttl_up() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        assert!(cache.set("k", &"v", Some(Duration::from_millis(500))).await);

        let envelope: CacheEnvelope<String> = CacheEnvelope::decode(&store.raw("k").unwrap()).unwrap();
        assert_eq!(envelope.ttl, 1);
        assert_eq!(store.backend_ttl("k"), Some(Duration::from_secs(11)));
        assert_eq!(cache.get::<String>("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_set_with_huge_ttl_saturates_backend_ttl() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        assert!(cache.set("k", &1u32, Some(Duration::from_secs(u64::MAX))).await);

        assert_eq!(store.backend_ttl("k"), Some(Duration::MAX));
        assert_eq!(cache.get::<u32>("k").await, Some(1));
    }

    #[tokio::test]
    async fn test_get_or_compute_sub_second_ttl_still_caches() {
        let (_store, _clock, cache) = setup();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let value = cache
                .get_or_compute("j", Some(Duration::from_millis(500)), counting_producer(calls.clone(), "v"))
                .await
                .unwrap();
            assert_eq!(value, "v");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_fresh_value() {
        let (store, _clock, cache) = setup();
        store
            .set_raw("k", &raw_envelope("v", NOW - 10, 60), Duration::from_secs(70))
            .await
            .unwrap();

        let value: Option<String> = cache.get("k").await;
        assert_eq!(value, Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_get_missing_unlocked_is_not_found() {
        let (_store, clock, cache) = setup();
        let started = clock.now_millis();

        let value: Option<String> = cache.get("k").await;

        assert!(value.is_none());
        assert_eq!(clock.now_millis(), started, "no waiting when nobody holds the lock");
    }

    #[tokio::test]
    async fn test_get_expired_unlocked_is_not_found() {
        let (store, _clock, cache) = setup();
        store
            .set_raw("k", &raw_envelope("old", NOW - 120, 60), Duration::from_secs(70))
            .await
            .unwrap();

        let value: Option<String> = cache.get("k").await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_get_serves_stale_value_while_locked() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());
        store
            .set_raw("k", &raw_envelope("old", NOW - 120, 60), Duration::from_secs(70))
            .await
            .unwrap();

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);

        let calls = Arc::new(AtomicUsize::new(0));
        let value = b
            .get_or_compute("k", None, counting_producer(calls.clone(), "new"))
            .await
            .unwrap();

        assert_eq!(value, "old");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_gives_up_after_retry_budget() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);
        let started = clock.now_millis();

        let value: Option<String> = b.get("k").await;

        assert!(value.is_none());
        assert_eq!(clock.now_millis() - started, 3 * 50);
    }

    #[tokio::test]
    async fn test_get_ignores_malformed_envelope() {
        let store = Arc::new(MockStore::new().with_raw("k", r#"{"payload": "v"}"#));
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let cache = cache_with(&store, &clock, config());

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache
            .get_or_compute("k", None, counting_producer(calls.clone(), "fresh"))
            .await
            .unwrap();

        assert_eq!(value, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_miss_stores_and_releases() {
        let (store, _clock, cache) = setup();
        let calls = Arc::new(AtomicUsize::new(0));

        let value = cache
            .get_or_compute("k", Some(Duration::from_secs(60)), counting_producer(calls.clone(), "v1"))
            .await
            .unwrap();

        assert_eq!(value, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.raw("lock_k").is_none());
        assert_eq!(cache.held_lock_count(), 0);

        let cached: Option<String> = cache.get("k").await;
        assert_eq!(cached, Some("v1".to_string()));
    }

    #[tokio::test]
    async fn test_get_or_compute_hit_skips_producer() {
        let (store, _clock, cache) = setup();
        store
            .set_raw("k", &raw_envelope("cached", NOW, 60), Duration::from_secs(70))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache
            .get_or_compute("k", None, counting_producer(calls.clone(), "new"))
            .await
            .unwrap();

        assert_eq!(value, "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_or_compute_refreshes_expired_value() {
        let (store, _clock, cache) = setup();
        store
            .set_raw("k", &raw_envelope("old", NOW - 61, 60), Duration::from_secs(70))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache
            .get_or_compute("k", Some(Duration::from_secs(60)), counting_producer(calls.clone(), "new"))
            .await
            .unwrap();

        assert_eq!(value, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get::<String>("k").await, Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_non_owner_result_is_not_persisted() {
        let (store, clock, a) = setup();
        let b = cache_with(&store, &clock, config());

        assert!(a.acquire_lock("k", None, Duration::ZERO).await);

        let calls = Arc::new(AtomicUsize::new(0));
        let value = b
            .get_or_compute("k", None, counting_producer(calls.clone(), "from-b"))
            .await
            .unwrap();

        assert_eq!(value, "from-b");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.raw("k").is_none());
        assert!(a.has_lock("k").await);
    }

    #[tokio::test]
    async fn test_waiter_picks_up_refreshers_value() {
        let (store, clock, a) = setup();
        // Generous budgets: the waiter must still be polling whenever the holder gets to run
        let b = cache_with(&store, &clock, config().with_retry_count(10_000));

        assert!(a.acquire_lock("k", Some(Duration::from_secs(3600)), Duration::ZERO).await);

        let calls = Arc::new(AtomicUsize::new(0));
        let producer = counting_producer(calls.clone(), "from-b");
        let waiter = tokio::spawn(async move {
            b.get_or_compute("k", Some(Duration::from_secs(60)), producer)
                .await
        });

        tokio::task::yield_now().await;
        assert!(a.set("k", &"v1", Some(Duration::from_secs(60))).await);
        assert!(a.release_lock("k", false).await);

        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_persist_a_single_result() {
        let store = Arc::new(MockStore::new());
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let calls = Arc::new(AtomicUsize::new(0));

        let holder = cache_with(&store, &clock, config());
        assert!(holder.acquire_lock("k", None, Duration::ZERO).await);

        let mut handles = Vec::new();
        for i in 0..5 {
            let cache = cache_with(&store, &clock, config().with_retry_count(0));
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", None, move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move { Ok::<_, Infallible>(format!("worker-{i}")) }
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(store.write_count(), 1, "only the holder's lock record was written");
        assert!(store.raw("k").is_none());
    }

    #[tokio::test]
    async fn test_producer_error_propagates_and_releases_lock() {
        let (store, _clock, cache) = setup();

        let result: Result<String, &str> = cache
            .get_or_compute("k", None, || async { Err("upstream down") })
            .await;

        assert_eq!(result, Err("upstream down"));
        assert!(store.raw("k").is_none());
        assert!(store.raw("lock_k").is_none());
        assert_eq!(cache.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_still_runs_producer() {
        let store = Arc::new(MockStore::new().with_error("connection refused"));
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let cache = cache_with(&store, &clock, config());

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache
            .get_or_compute("k", None, counting_producer(calls.clone(), "v"))
            .await
            .unwrap();

        assert_eq!(value, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.del("k").await);
    }

    #[tokio::test]
    async fn test_read_failure_is_a_miss_with_scripted_store() {
        let mut mock = MockKeyValueStore::new();
        mock.expect_get_raw()
            .returning(|_| Err(DomainError::cache("timeout")));
        mock.expect_get_many_raw()
            .returning(|_| Err(DomainError::cache("timeout")));

        let clock = Arc::new(ManualClock::at_secs(NOW));
        let cache = LockingCache::with_clock(Arc::new(mock), config(), clock).unwrap();

        assert_eq!(cache.get::<String>("k").await, None);
        assert!(!cache.is_locked("k").await);

        let results = cache.get_multiple::<String>(&["a", "b"]).await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_get_multiple_marks_misses() {
        let (store, _clock, cache) = setup();
        store
            .set_raw("fresh", &raw_envelope(false, NOW, 60), Duration::from_secs(70))
            .await
            .unwrap();
        store
            .set_raw("expired", &raw_envelope(true, NOW - 100, 60), Duration::from_secs(70))
            .await
            .unwrap();
        store
            .set_raw("corrupt", "{}", Duration::from_secs(70))
            .await
            .unwrap();

        let results = cache
            .get_multiple::<bool>(&["fresh", "expired", "corrupt", "absent"])
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results["fresh"], Some(false));
        assert_eq!(results["expired"], None);
        assert_eq!(results["corrupt"], None);
        assert_eq!(results["absent"], None);
    }

    #[tokio::test]
    async fn test_del_removes_value_but_not_lock() {
        let (store, _clock, cache) = setup();

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        assert!(cache.set("k", &"v", None).await);

        assert!(cache.del("k").await);
        assert!(store.raw("k").is_none());
        assert!(cache.has_lock("k").await);
        assert!(cache.del("k").await);
    }

    #[tokio::test]
    async fn test_custom_lock_prefix() {
        let store = Arc::new(MockStore::new());
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let cache = cache_with(&store, &clock, config().with_lock_prefix("mutex:"));

        assert!(cache.acquire_lock("k", None, Duration::ZERO).await);
        assert!(store.raw("mutex:k").is_some());
        assert!(store.raw("lock_k").is_none());
    }

    #[tokio::test]
    async fn test_disabled_bypasses_store() {
        let store = Arc::new(MockStore::new());
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let cache = cache_with(&store, &clock, config().disabled());

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let value = cache
                .get_or_compute("k", None, counting_producer(calls.clone(), "v"))
                .await
                .unwrap();
            assert_eq!(value, "v");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.acquire_lock("k", None, Duration::from_secs(1)).await);
        assert!(!cache.has_lock("k").await);
        assert!(cache.set("k", &"v", None).await);
        assert!(cache.del("k").await);
        assert!(cache.release_lock("k", false).await);
        assert_eq!(cache.get::<String>("k").await, None);
        assert_eq!(cache.get_multiple::<String>(&["k"]).await["k"], None);
        assert_eq!(store.call_count(), 0);
    }
}
