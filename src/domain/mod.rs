pub mod cache;
pub mod error;

pub use cache::{CacheEnvelope, Clock, KeyValueStore, SystemClock};
pub use error::DomainError;
