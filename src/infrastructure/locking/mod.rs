//! Locking cache - stampede protection over a shared key/value store

mod config;
mod lock_table;
mod service;

pub use config::LockingCacheConfig;
pub use lock_table::LockTable;
pub use service::LockingCache;
