//! Locking cache configuration

use std::time::Duration;

use crate::domain::DomainError;

/// Per-instance settings, fixed once the cache is constructed
#[derive(Debug, Clone)]
pub struct LockingCacheConfig {
    /// When false every operation is a passthrough and the store is never touched
    pub enabled: bool,
    /// Max retries while waiting for a locked key to be (re)filled
    pub retry_count: u32,
    /// Sleep between retries
    pub retry_sleep: Duration,
    /// TTL of lock records
    pub lock_time: Duration,
    /// Prefix prepended to a key to form its lock key
    pub lock_prefix: String,
    /// Extra backend TTL so logically expired values stay readable for a while
    pub ttl_buffer: Duration,
}

impl Default for LockingCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_count: 5,
            retry_sleep: Duration::from_millis(100),
            lock_time: Duration::from_secs(30),
            lock_prefix: "lock_".to_string(),
            ttl_buffer: Duration::from_secs(60),
        }
    }
}

impl LockingCacheConfig {
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_sleep(mut self, sleep: Duration) -> Self {
        self.retry_sleep = sleep;
        self
    }

    pub fn with_lock_time(mut self, lock_time: Duration) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn with_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lock_prefix = prefix.into();
        self
    }

    pub fn with_ttl_buffer(mut self, buffer: Duration) -> Self {
        self.ttl_buffer = buffer;
        self
    }

    /// Turns off locking and caching entirely
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.lock_prefix.is_empty() {
            return Err(DomainError::configuration(
                "lock_prefix must not be empty, lock records would collide with cached values",
            ));
        }

        if self.lock_time.as_secs() == 0 {
            return Err(DomainError::configuration(
                "lock_time must be at least one second",
            ));
        }

        Ok(())
    }
}
