//! Prometheus metrics for the locking cache

use std::sync::Arc;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use super::config::MetricsConfig;

/// Prometheus metrics handle
#[derive(Clone)]
pub struct PrometheusMetrics {
    handle: Arc<PrometheusHandle>,
}

impl PrometheusMetrics {
    /// Renders all recorded metrics in the Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Installs the global Prometheus recorder
pub fn init_metrics(config: &MetricsConfig) -> Option<PrometheusMetrics> {
    if !config.enabled {
        tracing::debug!("Prometheus metrics disabled");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            gauge!("locking_cache_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
            tracing::info!("Prometheus metrics initialized");

            Some(PrometheusMetrics {
                handle: Arc::new(handle),
            })
        }
        Err(e) => {
            tracing::error!("Failed to initialize Prometheus metrics: {}", e);
            None
        }
    }
}

/// How a cache read was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Fresh value served
    Hit,
    /// Expired value served while another party refreshes it
    Stale,
    /// Nothing usable and nobody refreshing
    Miss,
    /// Retries exhausted while the key stayed locked
    GaveUp,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Stale => "stale",
            Self::Miss => "miss",
            Self::GaveUp => "gave_up",
        }
    }
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Contended,
    StoreError,
}

impl LockOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Contended => "contended",
            Self::StoreError => "store_error",
        }
    }
}

pub fn record_lookup(outcome: LookupOutcome) {
    counter!("locking_cache_lookups_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn record_lock(outcome: LockOutcome) {
    counter!("locking_cache_lock_attempts_total", "outcome" => outcome.as_str()).increment(1);
}

/// Records a producer invocation and whether its result could be persisted
pub fn record_producer_run(persisted: bool) {
    let persisted = if persisted { "true" } else { "false" };
    counter!("locking_cache_producer_runs_total", "persisted" => persisted).increment(1);
}

pub fn record_rejected_write() {
    counter!("locking_cache_rejected_writes_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(LookupOutcome::Hit.as_str(), "hit");
        assert_eq!(LookupOutcome::Stale.as_str(), "stale");
        assert_eq!(LookupOutcome::GaveUp.as_str(), "gave_up");
        assert_eq!(LockOutcome::Contended.as_str(), "contended");
    }

    #[test]
    fn test_disabled_metrics_installs_nothing() {
        assert!(init_metrics(&MetricsConfig::default()).is_none());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_lookup(LookupOutcome::Miss);
        record_lock(LockOutcome::Acquired);
        record_producer_run(false);
        record_rejected_write();
    }
}
