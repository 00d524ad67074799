use std::time::Duration;

use serde::Deserialize;

use crate::domain::DomainError;
use crate::infrastructure::cache::StoreConfig;
use crate::infrastructure::locking::LockingCacheConfig;
use crate::infrastructure::observability::MetricsConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub store: StoreSettings,
    pub locking: LockingSettings,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Backend selection, see [`StoreConfig`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// `in_memory` or `redis`
    pub backend: String,
    pub redis_url: Option<String>,
    pub key_prefix: Option<String>,
    pub default_ttl_secs: u64,
    pub max_capacity: u64,
}

/// Stampede protection knobs, see [`LockingCacheConfig`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockingSettings {
    pub enabled: bool,
    pub retry_count: u32,
    pub retry_sleep_ms: u64,
    pub lock_time_secs: u64,
    pub lock_prefix: String,
    pub ttl_buffer_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: "in_memory".to_string(),
            redis_url: None,
            key_prefix: None,
            default_ttl_secs: 3600,
            max_capacity: 10_000,
        }
    }
}

impl Default for LockingSettings {
    fn default() -> Self {
        let defaults = LockingCacheConfig::default();

        Self {
            enabled: defaults.enabled,
            retry_count: defaults.retry_count,
            retry_sleep_ms: defaults.retry_sleep.as_millis() as u64,
            lock_time_secs: defaults.lock_time.as_secs(),
            lock_prefix: defaults.lock_prefix,
            ttl_buffer_secs: defaults.ttl_buffer.as_secs(),
        }
    }
}

impl StoreSettings {
    pub fn to_store_config(&self) -> Result<StoreConfig, DomainError> {
        Ok(StoreConfig {
            store_type: self.backend.parse()?,
            redis_url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            max_capacity: Some(self.max_capacity),
        })
    }
}

impl From<&LockingSettings> for LockingCacheConfig {
    fn from(settings: &LockingSettings) -> Self {
        Self {
            enabled: settings.enabled,
            retry_count: settings.retry_count,
            retry_sleep: Duration::from_millis(settings.retry_sleep_ms),
            lock_time: Duration::from_secs(settings.lock_time_secs),
            lock_prefix: settings.lock_prefix.clone(),
            ttl_buffer: Duration::from_secs(settings.ttl_buffer_secs),
        }
    }
}

impl AppConfig {
    /// Loads `config/default`, `config/local`, then `APP__*` environment overrides
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
