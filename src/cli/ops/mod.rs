//! Single-key commands

use std::time::Duration;

use serde_json::Value;

use crate::LockingCache;

use super::bootstrap;

/// Parses CLI input as JSON, falling back to a plain string
pub fn parse_value(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

pub async fn get(key: &str) -> anyhow::Result<()> {
    let runtime = bootstrap().await?;
    let cache = runtime.locking_cache()?;

    match cache.get::<Value>(key).await {
        Some(value) => println!("{}", value),
        None => println!("(not found)"),
    }

    runtime.render_metrics();
    Ok(())
}

pub async fn multi_get(keys: &[String]) -> anyhow::Result<()> {
    let runtime = bootstrap().await?;
    let cache = runtime.locking_cache()?;

    for line in multi_get_lines(&cache, keys).await {
        println!("{}", line);
    }

    runtime.render_metrics();
    Ok(())
}

/// One `key<TAB>value` line per requested key, in request order
async fn multi_get_lines(cache: &LockingCache, keys: &[String]) -> Vec<String> {
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let results = cache.get_multiple::<Value>(&refs).await;

    keys.iter()
        .map(|key| match results.get(key).and_then(|value| value.as_ref()) {
            Some(value) => format!("{}\t{}", key, value),
            None => format!("{}\t(not found)", key),
        })
        .collect()
}

pub async fn put(key: &str, value: &str, ttl: Option<u64>) -> anyhow::Result<()> {
    let runtime = bootstrap().await?;
    let cache = runtime.locking_cache()?;
    let value = parse_value(value);

    if !cache.acquire_lock(key, None, Duration::ZERO).await {
        anyhow::bail!("key '{}' is locked by another writer", key);
    }

    let stored = cache.set(key, &value, ttl.map(Duration::from_secs)).await;
    cache.release_lock(key, false).await;

    if !stored {
        anyhow::bail!("failed to store key '{}'", key);
    }

    println!("stored {}", key);
    Ok(())
}

pub async fn del(key: &str) -> anyhow::Result<()> {
    let runtime = bootstrap().await?;
    let cache = runtime.locking_cache()?;

    if !cache.del(key).await {
        anyhow::bail!("failed to delete key '{}'", key);
    }

    println!("deleted {}", key);
    Ok(())
}

pub async fn lock(key: &str, ttl: Option<u64>, timeout_ms: u64) -> anyhow::Result<()> {
    let runtime = bootstrap().await?;
    let cache = runtime.locking_cache()?;

    let acquired = cache
        .acquire_lock(
            key,
            ttl.map(Duration::from_secs),
            Duration::from_millis(timeout_ms),
        )
        .await;

    if !acquired {
        anyhow::bail!("lock on '{}' is held by another party", key);
    }

    let token = cache.current_lock(key).await.unwrap_or_default();
    println!("locked {} (token {:016x})", key, token);
    Ok(())
}

pub async fn unlock(key: &str, force: bool) -> anyhow::Result<()> {
    let runtime = bootstrap().await?;
    let cache = runtime.locking_cache()?;

    if !cache.release_lock(key, force).await {
        anyhow::bail!("lock on '{}' is held by another party (use --force)", key);
    }

    println!("unlocked {}", key);
    Ok(())
}
