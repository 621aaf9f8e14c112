use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use moka::ops::compute::Op;

use super::{Store, StoreError};

/// A value saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct StoredValue {
    /// When to evict this value.
    deadline: Instant,
    /// The actual data.
    data: Bytes,
}

impl StoredValue {
    fn new(data: Bytes, ttl: Duration) -> Self {
        Self {
            deadline: Instant::now() + ttl,
            data,
        }
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`StoredValue`] deadline as the explicit
/// expiration time.
struct ValueExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed, this will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<String, StoredValue> for ValueExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// A [`Store`] living in process memory.
///
/// Suitable for tests and single-instance deployments. Counters are kept as their decimal text
/// form, like Redis does.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    cache: moka::future::Cache<String, StoredValue>,
}

impl MemoryStore {
    pub fn new(capacity: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(capacity)
            .name("signalcache-store")
            .expire_after(ValueExpiration)
            .build();
        Self { cache }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

fn parse_counter(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.cache.get(key).await.map(|value| value.data))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.cache
            .insert(key.to_owned(), StoredValue::new(value, ttl))
            .await;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let entry = self
            .cache
            .entry_by_ref(key)
            .or_insert(StoredValue::new(value, ttl))
            .await;
        Ok(entry.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError> {
        let mut outcome = Err(StoreError::Protocol(format!(
            "value at `{key}` is not an integer"
        )));

        self.cache
            .entry_by_ref(key)
            .and_compute_with(|entry| {
                let op = match entry {
                    None => {
                        outcome = Ok(by);
                        Op::Put(StoredValue::new(by.to_string().into(), ttl))
                    }
                    Some(entry) => {
                        let previous = entry.into_value();
                        match parse_counter(&previous.data) {
                            Some(count) => {
                                let count = count.saturating_add(by);
                                outcome = Ok(count);
                                Op::Put(StoredValue {
                                    deadline: previous.deadline,
                                    data: count.to_string().into(),
                                })
                            }
                            None => Op::Nop,
                        }
                    }
                };
                std::future::ready(op)
            })
            .await;

        outcome
    }
}
