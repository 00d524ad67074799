//! Observability infrastructure - Metrics

mod config;
mod metrics;

pub use config::MetricsConfig;
pub use metrics::{
    init_metrics, record_lock, record_lookup, record_producer_run, record_rejected_write,
    LockOutcome, LookupOutcome, PrometheusMetrics,
};
