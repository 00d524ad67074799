//! Time source used for envelope timestamps and retry sleeps

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

/// Wall clock plus an async sleep
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;

    /// Seconds since the Unix epoch
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }

    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by chrono and the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Virtual clock: `sleep` advances time instantly and yields to the scheduler
    #[derive(Debug)]
    pub struct ManualClock {
        millis: AtomicU64,
    }

    impl ManualClock {
        pub fn at_secs(secs: u64) -> Self {
            Self {
                millis: AtomicU64::new(secs * 1000),
            }
        }

        pub fn advance(&self, duration: Duration) {
            self.millis
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
            tokio::task::yield_now().await;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_sleep_advances_virtual_time() {
            let clock = ManualClock::at_secs(100);
            clock.sleep(Duration::from_millis(1500)).await;

            assert_eq!(clock.now_millis(), 101_500);
            assert_eq!(clock.now_secs(), 101);
        }
    }
}
