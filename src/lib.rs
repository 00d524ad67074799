//! Locking cache
//!
//! Stampede protection on top of a shared key/value store that has no native
//! locking:
//! - Lock records with random ownership tokens and TTL self-healing
//! - Get-or-compute that serves stale values while a refresh is in flight
//! - Lock-gated writes, so only the refresher persists its result
//! - In-memory (moka) and Redis backends

pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::AppConfig;
pub use domain::{CacheEnvelope, Clock, DomainError, KeyValueStore, SystemClock};
pub use infrastructure::cache::{InMemoryStore, RedisStore, StoreConfig, StoreFactory, StoreType};
pub use infrastructure::locking::{LockingCache, LockingCacheConfig};
