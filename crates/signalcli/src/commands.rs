use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use signalcache_service::caching::store::create_store;
use signalcache_service::caching::{
    Artifact, CacheKey, Caller, Computed, RateLimiter, StoreService, canonicalize,
};
use signalcache_service::config::Config;

use crate::cli::{KeyArgs, RateLimitArgs};

async fn connect(config: &Config) -> Result<StoreService> {
    let store = create_store(&config.store)
        .await
        .context("failed to connect to the store")?;
    Ok(StoreService::new(
        store,
        config.store.timeout,
        config.store_retry,
    ))
}

async fn read_payload(path: Option<&Path>) -> Result<Value> {
    let raw = match path {
        None => return Ok(Value::Object(Default::default())),
        Some(path) if path == Path::new("-") => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("failed to read the payload from stdin")?;
            raw
        }
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read payload file `{}`", path.display()))?,
    };

    serde_json::from_str(&raw).context("payload is not valid JSON")
}

/// Derives the canonical form and the cache key of a payload.
pub async fn key(args: KeyArgs) -> Result<()> {
    let payload = read_payload(args.payload.as_deref()).await?;
    let canonical = canonicalize(&payload)?;
    let key = CacheKey::for_context(args.computation, &args.reference, args.version, &payload)?;

    println!("canonical: {canonical}");
    println!("key:       {key}");
    Ok(())
}

/// Prints the stored artifact with its freshness as of now.
pub async fn inspect(config: &Config, key: &str) -> Result<()> {
    let key: CacheKey = key.parse()?;
    let store = connect(config).await?;

    let Some(data) = store.get(key.as_str()).await? else {
        anyhow::bail!("no artifact stored under `{key}`");
    };
    let artifact = Artifact::<Value>::decode(&data).context("stored artifact is malformed")?;

    let policy = config.computations.get(key.computation()).policy;
    let verdict = policy.classify(artifact.produced_at, Utc::now());
    let computed = Computed {
        key,
        artifact: Arc::new(artifact),
        verdict,
        degraded: false,
    };

    println!("{}", serde_json::to_string_pretty(&computed)?);
    Ok(())
}

/// Deletes a stored artifact.
pub async fn purge(config: &Config, key: &str) -> Result<()> {
    let key: CacheKey = key.parse()?;
    let store = connect(config).await?;

    if store.delete(key.as_str()).await? {
        println!("deleted `{key}`");
    } else {
        println!("nothing stored under `{key}`");
    }
    Ok(())
}

/// Counts one request by the given caller, and prints the decision payload.
pub async fn rate_limit(config: &Config, args: RateLimitArgs) -> Result<()> {
    if !config.rate_limits.enabled {
        tracing::warn!("rate limits are disabled in the configuration");
    }

    let store = connect(config).await?;
    let rate_limiter = RateLimiter::new(store, config.rate_limits.clone());
    let caller = Caller {
        ip: args.ip,
        user_id: args.user,
    };

    let decision = rate_limiter.check(&caller).await;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_read_payload() {
        signalcache_test::setup();

        assert_eq!(read_payload(None).await.unwrap(), serde_json::json!({}));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"window": "1h", "venues": ["dex"]}"#)
            .unwrap();

        let payload = read_payload(Some(file.path())).await.unwrap();
        assert_eq!(canonicalize(&payload).unwrap(), r#"{"venues":["dex"],"window":"1h"}"#);

        std::fs::write(file.path(), "not json").unwrap();
        assert!(read_payload(Some(file.path())).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_and_inspect_missing() {
        signalcache_test::setup();
        let config = Config::default();
        let key = CacheKey::for_context(
            signalcache_service::caching::ComputationType::Oracle,
            "BTC",
            1,
            &serde_json::json!({}),
        )
        .unwrap();

        // the default memory store starts out empty
        purge(&config, key.as_str()).await.unwrap();
        let err = inspect(&config, key.as_str()).await.unwrap_err();
        assert!(err.to_string().contains("no artifact stored"), "{err}");

        assert!(inspect(&config, "oracle:BTC").await.is_err());
    }
}
