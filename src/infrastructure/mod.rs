pub mod cache;
pub mod locking;
pub mod logging;
pub mod observability;
