//! CLI module for the locking cache
//!
//! Provides subcommands to inspect and exercise a configured store:
//! - `get` / `multi-get` / `put` / `del`: value operations through the locking cache
//! - `lock` / `unlock`: manual lock maintenance
//! - `stampede`: many concurrent workers racing to fill one key

pub mod ops;
pub mod stampede;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::domain::cache::KeyValueStore;
use crate::infrastructure::cache::StoreFactory;
use crate::infrastructure::locking::LockingCache;
use crate::infrastructure::logging;
use crate::infrastructure::observability::{init_metrics, PrometheusMetrics};

/// Locking cache - stampede-safe caching over a shared key/value store
#[derive(Parser)]
#[command(name = "locking-cache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Read a key, waiting briefly if someone is refreshing it
    Get { key: String },

    /// Read several keys in one round trip, without waiting
    MultiGet {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Store a JSON value under a key (takes and releases the key's lock)
    Put {
        key: String,
        /// JSON value; plain text is stored as a string
        value: String,
        /// Logical TTL in seconds (store default when omitted)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a key (its lock is left alone)
    Del { key: String },

    /// Take the lock on a key; it is held until its TTL runs out
    Lock {
        key: String,
        /// Lock TTL in seconds (configured lock time when omitted)
        #[arg(long)]
        ttl: Option<u64>,
        /// How long to wait for a lock held elsewhere
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },

    /// Release the lock on a key
    Unlock {
        key: String,
        /// Remove the lock even if it belongs to someone else
        #[arg(long)]
        force: bool,
    },

    /// Run concurrent workers against one key and report how many recomputed it
    Stampede(stampede::StampedeArgs),
}

/// Loaded configuration plus the shared store every cache instance talks to
pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub metrics: Option<PrometheusMetrics>,
}

impl Runtime {
    /// A new locking cache instance with its own lock table
    pub fn locking_cache(&self) -> anyhow::Result<LockingCache> {
        let cache = LockingCache::new(self.store.clone(), (&self.config.locking).into())
            .context("invalid locking configuration")?;
        Ok(cache)
    }

    /// Prints recorded metrics when the Prometheus recorder is installed
    pub fn render_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            println!("{}", metrics.render());
        }
    }
}

/// Loads configuration, initializes logging and metrics, connects the store
pub async fn bootstrap() -> anyhow::Result<Runtime> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    logging::init_logging(&config.logging);

    let metrics = init_metrics(&config.metrics);

    let store_config = config.store.to_store_config()?;
    let store = StoreFactory::new().create(&store_config).await?;
    tracing::info!(backend = %store_config.store_type, "Store ready");

    Ok(Runtime {
        config,
        store,
        metrics,
    })
}
