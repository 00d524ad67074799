//! Stampede command - many workers, one key, count the recomputations

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::cache::KeyValueStore;
use crate::infrastructure::locking::{LockingCache, LockingCacheConfig};

use super::bootstrap;

#[derive(Args, Debug, Clone)]
pub struct StampedeArgs {
    /// Key every worker asks for
    #[arg(long, default_value = "stampede")]
    pub key: String,

    /// Number of concurrent workers, each with its own cache instance
    #[arg(long, default_value_t = 20)]
    pub workers: usize,

    /// Simulated producer latency in milliseconds
    #[arg(long, default_value_t = 200)]
    pub work_ms: u64,

    /// TTL of the produced value in seconds
    #[arg(long, default_value_t = 60)]
    pub ttl: u64,

    /// Keep an existing value instead of deleting it first
    #[arg(long)]
    pub keep: bool,
}

/// Value each worker's producer would write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducedValue {
    pub worker: usize,
    pub computed_at: String,
}

/// Outcome of a stampede run
#[derive(Debug, Clone)]
pub struct StampedeReport {
    pub workers: usize,
    pub producer_runs: usize,
    /// Distinct producers whose values callers received
    pub distinct_results: usize,
    /// Worker whose value ended up in the store
    pub persisted_by: Option<usize>,
}

pub async fn run(args: StampedeArgs) -> anyhow::Result<()> {
    let runtime = bootstrap().await?;
    let config: LockingCacheConfig = (&runtime.config.locking).into();

    let report = simulate(runtime.store.clone(), config, &args).await?;

    info!(
        workers = report.workers,
        producer_runs = report.producer_runs,
        "Stampede finished"
    );

    println!("workers:           {}", report.workers);
    println!("producer runs:     {}", report.producer_runs);
    println!("distinct results:  {}", report.distinct_results);
    match report.persisted_by {
        Some(worker) => println!("persisted by:      worker {}", worker),
        None => println!("persisted by:      (nothing stored)"),
    }

    runtime.render_metrics();
    Ok(())
}

/// Spawns `args.workers` tasks that all call `get_or_compute` on the same key
pub async fn simulate(
    store: Arc<dyn KeyValueStore>,
    config: LockingCacheConfig,
    args: &StampedeArgs,
) -> anyhow::Result<StampedeReport> {
    let observer = LockingCache::new(store.clone(), config.clone())?;

    if !args.keep {
        observer.del(&args.key).await;
    }

    let producer_runs = Arc::new(AtomicUsize::new(0));
    let ttl = Duration::from_secs(args.ttl);
    let work = Duration::from_millis(args.work_ms);

    let mut handles = Vec::with_capacity(args.workers);

    for worker in 0..args.workers {
        let cache = LockingCache::new(store.clone(), config.clone())?;
        let key = args.key.clone();
        let producer_runs = producer_runs.clone();

        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute(&key, Some(ttl), move || async move {
                    producer_runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(work).await;

                    Ok::<_, anyhow::Error>(ProducedValue {
                        worker,
                        computed_at: chrono::Utc::now().to_rfc3339(),
                    })
                })
                .await
        }));
    }

    let mut distinct = BTreeSet::new();

    for result in futures::future::join_all(handles).await {
        let value = result.context("worker task panicked")??;
        distinct.insert(value.worker);
    }

    let persisted = observer.get::<ProducedValue>(&args.key).await;

    Ok(StampedeReport {
        workers: args.workers,
        producer_runs: producer_runs.load(Ordering::SeqCst),
        distinct_results: distinct.len(),
        persisted_by: persisted.map(|value| value.worker),
    })
}
