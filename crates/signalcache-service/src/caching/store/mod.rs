//! The durable key-value store holding artifacts and rate-limit counters.
//!
//! The [`Store`] trait is the raw backend contract. [`StoreService`] wraps a backend with the
//! configured timeout and retry policy, and is what the rest of the crate talks to.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::CacheError;
use super::retry::{RetryError, RetryPolicy, run_with_retry};

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

/// A failed round trip to the store.
///
/// Every variant is considered transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::Protocol(_) => "protocol",
        }
    }
}

/// A key-value store with per-key time to live.
///
/// All operations are atomic with respect to concurrent callers on the same key.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Returns the value at `key`, or `None` if it is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Stores `value` at `key`, replacing any previous value and its TTL.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Stores `value` at `key` unless a value already exists there.
    ///
    /// Returns `true` if the value was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Adds `by` to the integer counter at `key` and returns the new count.
    ///
    /// A missing counter starts at zero and expires after `ttl`. Incrementing an existing counter
    /// keeps its expiry.
    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError>;
}

pub type StoreRef = Arc<dyn Store>;

/// The backend to use for the store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendConfig {
    /// A process-local store.
    ///
    /// Artifacts are lost on restart and not shared with other instances.
    Memory(MemoryStoreConfig),
    /// A Redis server, requires the `redis` feature.
    Redis(RedisStoreConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemoryStoreConfig {
    /// Maximum number of keys kept.
    #[serde(default = "default_memory_capacity")]
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection url, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
}

/// Configuration of the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Upper bound for a single store round trip.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// The backend to use for the store.
    #[serde(flatten)]
    pub backend: StoreBackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout: default_store_timeout(),
            backend: StoreBackendConfig::Memory(MemoryStoreConfig {
                capacity: default_memory_capacity(),
            }),
        }
    }
}

fn default_memory_capacity() -> u64 {
    100_000
}

fn default_store_timeout() -> Duration {
    Duration::from_millis(500)
}

/// Creates the configured store backend.
pub async fn create_store(config: &StoreConfig) -> Result<StoreRef, StoreError> {
    match &config.backend {
        StoreBackendConfig::Memory(cfg) => Ok(Arc::new(MemoryStore::new(cfg.capacity))),
        #[cfg(feature = "redis")]
        StoreBackendConfig::Redis(cfg) => Ok(Arc::new(RedisStore::connect(&cfg.url).await?)),
        #[cfg(not(feature = "redis"))]
        StoreBackendConfig::Redis(_) => Err(StoreError::Connection(
            "the redis store backend is not compiled in".into(),
        )),
    }
}

/// A [`Store`] with bounded and retried round trips.
///
/// Every call is cut off after the configured timeout, and failed calls are retried with the
/// store retry policy. A call that still fails surfaces as [`CacheError::StoreUnavailable`].
#[derive(Debug, Clone)]
pub struct StoreService {
    store: StoreRef,
    timeout: Duration,
    retry: RetryPolicy,
}

impl StoreService {
    pub fn new(store: StoreRef, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            timeout,
            retry,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.call("store.get", &self.retry, || self.store.get(key))
            .await
    }

    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.call("store.set", &self.retry, || {
            self.store.set(key, value.clone(), ttl)
        })
        .await
    }

    pub async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.call("store.set_if_absent", &self.retry, || {
            self.store.set_if_absent(key, value.clone(), ttl)
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.call("store.delete", &self.retry, || self.store.delete(key))
            .await
    }

    /// Increments a counter.
    ///
    /// Unlike the other operations this is never retried, since a timed out increment may still
    /// have been applied.
    pub async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CacheError> {
        self.call("store.increment", &RetryPolicy::no_retries(), || {
            self.store.increment(key, by, ttl)
        })
        .await
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        retry: &RetryPolicy,
        mut f: F,
    ) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.timeout;
        let result = run_with_retry(
            operation,
            retry,
            &CancellationToken::new(),
            |_| true,
            |_| {
                let future = f();
                async move {
                    tokio::time::timeout(timeout, future)
                        .await
                        .unwrap_or(Err(StoreError::Timeout(timeout)))
                }
            },
        )
        .await;

        if let Err(err) = &result {
            metric!(
                counter("store.errors") += 1,
                "operation" => operation,
                "errdetails" => match err {
                    RetryError::NonRetryable(e)
                    | RetryError::ExhaustedRetries { cause: e, .. } => e.metrics_tag(),
                    RetryError::Cancelled => "cancelled",
                },
            );
        }

        result.map_err(CacheError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test::FailingStore;

    #[test]
    fn test_config() {
        let config: StoreConfig = serde_yaml::from_str("memory:\n  capacity: 10").unwrap();
        assert_eq!(
            config,
            StoreConfig {
                timeout: Duration::from_millis(500),
                backend: StoreBackendConfig::Memory(MemoryStoreConfig { capacity: 10 }),
            }
        );

        let config: StoreConfig =
            serde_yaml::from_str("timeout: 2s\nredis:\n  url: redis://cache:6379").unwrap();
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(
            config.backend,
            StoreBackendConfig::Redis(RedisStoreConfig {
                url: "redis://cache:6379".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_unavailable() {
        let store = Arc::new(FailingStore::default());
        let retry = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50)).unwrap();
        let service = StoreService::new(store.clone(), Duration::from_millis(100), retry);

        let result = service.get("pulse:SOL").await;
        assert!(matches!(result, Err(CacheError::StoreUnavailable(_))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_service_operations() {
        let service = StoreService::new(
            Arc::new(MemoryStore::default()),
            Duration::from_millis(100),
            RetryPolicy::no_retries(),
        );
        let ttl = Duration::from_secs(60);

        assert_eq!(service.get("oracle:BTC").await, Ok(None));
        assert_eq!(
            service
                .set_if_absent("oracle:BTC", Bytes::from_static(b"first"), ttl)
                .await,
            Ok(true)
        );
        assert_eq!(
            service
                .set_if_absent("oracle:BTC", Bytes::from_static(b"second"), ttl)
                .await,
            Ok(false)
        );
        assert_eq!(
            service.get("oracle:BTC").await,
            Ok(Some(Bytes::from_static(b"first")))
        );

        assert_eq!(service.delete("oracle:BTC").await, Ok(true));
        assert_eq!(service.delete("oracle:BTC").await, Ok(false));
    }

    #[derive(Debug, Default)]
    struct HangingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Store for HangingStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
        async fn set(&self, _: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn set_if_absent(&self, _: &str, _: Bytes, _: Duration) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn increment(&self, _: &str, _: i64, _: Duration) -> Result<i64, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let store = Arc::new(HangingStore::default());
        let service =
            StoreService::new(store.clone(), Duration::from_millis(100), RetryPolicy::no_retries());

        let result = service.get("oracle:ETH").await;
        assert_eq!(
            result,
            Err(CacheError::StoreUnavailable(
                "store operation timed out after 100ms".into()
            ))
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
