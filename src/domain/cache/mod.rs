//! Cache domain - shared key/value store abstraction and the envelope format
//! written on top of it

mod clock;
mod envelope;
mod store;

pub use clock::{Clock, SystemClock};
pub use envelope::CacheEnvelope;
pub use store::KeyValueStore;

#[cfg(test)]
pub use clock::mock::ManualClock;
#[cfg(test)]
pub use store::MockKeyValueStore;
#[cfg(test)]
pub use store::mock::MockStore;
