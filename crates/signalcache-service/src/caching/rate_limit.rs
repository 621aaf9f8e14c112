//! Fixed-window request ceilings per caller identity.
//!
//! Every request increments one counter per identity (the hashed IP address and, for
//! authenticated callers, the user id) in the current window. The counters live in the store and
//! expire with their window, so all instances sharing a store enforce the same ceilings.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::CacheError;
use super::store::StoreService;

/// The identities of whoever issued a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub ip: Option<IpAddr>,
    /// The id of an authenticated user.
    pub user_id: Option<String>,
}

impl Caller {
    pub fn anonymous(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            user_id: None,
        }
    }

    pub fn user(ip: Option<IpAddr>, user_id: impl Into<String>) -> Self {
        Self {
            ip,
            user_id: Some(user_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Length of one fixed window.
    #[serde(deserialize_with = "deserialize_window")]
    pub window: Duration,
    /// Requests per window and IP address.
    pub ip_limit: u64,
    /// Requests per window and authenticated user.
    pub user_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            ip_limit: 60,
            user_limit: 120,
        }
    }
}

fn deserialize_window<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let window: Duration = humantime_serde::deserialize(deserializer)?;
    if window.is_zero() {
        return Err(D::Error::custom("rate limit window must not be zero"));
    }
    Ok(window)
}

/// Which ceiling a request exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    IpLimit,
    UserLimit,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpLimit => "ip_limit",
            Self::UserLimit => "user_limit",
        }
    }
}

/// A request that was turned away.
///
/// Serializes as `{"allowed": false, "reason": .., "resetAt": ..}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDenial {
    pub reason: DenialReason,
    /// When the window that denied the request closes.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDenial {
    /// How long a caller should wait before trying again.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or_default()
    }
}

impl fmt::Display for RateLimitDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate limit exceeded ({}), resets at {}",
            self.reason.as_str(),
            self.reset_at.to_rfc3339()
        )
    }
}

impl Serialize for RateLimitDenial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("RateLimitDenial", 3)?;
        s.serialize_field("allowed", &false)?;
        s.serialize_field("reason", &self.reason)?;
        s.serialize_field("resetAt", &self.reset_at)?;
        s.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied(RateLimitDenial),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn into_result(self) -> Result<(), CacheError> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(denial) => Err(CacheError::RateLimited(denial)),
        }
    }
}

impl Serialize for RateLimitDecision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Allowed => {
                let mut s = serializer.serialize_struct("RateLimitDecision", 1)?;
                s.serialize_field("allowed", &true)?;
                s.end()
            }
            Self::Denied(denial) => denial.serialize(serializer),
        }
    }
}

/// Hashes an IP address so it can be used in keys and logs.
fn hash_ip(ip: IpAddr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    hex::encode(&digest[..16])
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: StoreService,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: StoreService, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts a request by `caller` and decides whether it may proceed.
    pub async fn check(&self, caller: &Caller) -> RateLimitDecision {
        self.check_at(caller, Utc::now()).await
    }

    /// Like [`check`](Self::check), as if the request was issued at `now`.
    ///
    /// All present identities are counted, even if an earlier one already denies the request.
    pub async fn check_at(&self, caller: &Caller, now: DateTime<Utc>) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::Allowed;
        }

        let window_ms = (self.config.window.as_millis() as i64).max(1);
        let index = now.timestamp_millis().div_euclid(window_ms);
        let reset_at = DateTime::from_timestamp_millis((index + 1) * window_ms).unwrap_or(now);

        let identities = [
            caller.ip.map(|ip| {
                let key = format!("ratelimit:ip:{}:{index}", hash_ip(ip));
                (DenialReason::IpLimit, key, self.config.ip_limit)
            }),
            caller.user_id.as_ref().map(|user_id| {
                let key = format!("ratelimit:user:{user_id}:{index}");
                (DenialReason::UserLimit, key, self.config.user_limit)
            }),
        ];

        let mut decision = RateLimitDecision::Allowed;
        for (reason, key, limit) in identities.into_iter().flatten() {
            let count = match self.store.increment(&key, 1, self.config.window).await {
                Ok(count) => count,
                Err(err) => {
                    // An unreachable store must not take down every request.
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        reason = reason.as_str(),
                        "Could not count request, allowing it"
                    );
                    metric!(counter("ratelimit.unavailable") += 1, "reason" => reason.as_str());
                    continue;
                }
            };

            if count > i64::try_from(limit).unwrap_or(i64::MAX) && decision.is_allowed() {
                tracing::debug!(reason = reason.as_str(), count, limit, "Rate limit exceeded");
                metric!(counter("ratelimit.denied") += 1, "reason" => reason.as_str());
                decision = RateLimitDecision::Denied(RateLimitDenial { reason, reset_at });
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use futures::future::join_all;

    use super::*;
    use crate::caching::RetryPolicy;
    use crate::caching::store::{MemoryStore, StoreRef};
    use crate::test::FailingStore;

    fn limiter_with(store: StoreRef, ip_limit: u64, user_limit: u64) -> RateLimiter {
        let store = StoreService::new(store, Duration::from_secs(1), RetryPolicy::no_retries());
        RateLimiter::new(
            store,
            RateLimitConfig {
                enabled: true,
                window: Duration::from_secs(60),
                ip_limit,
                user_limit,
            },
        )
    }

    fn limiter(ip_limit: u64, user_limit: u64) -> RateLimiter {
        limiter_with(Arc::new(MemoryStore::default()), ip_limit, user_limit)
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().to_utc()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_at_ceiling() {
        let limiter = limiter(10, 100);
        let caller = Caller::anonymous(ip("203.0.113.7"));
        let now = at("2026-10-18T12:00:30Z");

        let decisions = join_all((0..10).map(|_| limiter.check_at(&caller, now))).await;
        assert!(decisions.iter().all(RateLimitDecision::is_allowed));
    }

    #[tokio::test]
    async fn test_concurrent_above_ceiling() {
        let limiter = limiter(10, 100);
        let caller = Caller::anonymous(ip("203.0.113.7"));
        let now = at("2026-10-18T12:00:30Z");

        let decisions = join_all((0..11).map(|_| limiter.check_at(&caller, now))).await;
        let denials: Vec<_> = decisions
            .into_iter()
            .filter_map(|decision| match decision {
                RateLimitDecision::Allowed => None,
                RateLimitDecision::Denied(denial) => Some(denial),
            })
            .collect();

        assert_eq!(
            denials,
            [RateLimitDenial {
                reason: DenialReason::IpLimit,
                reset_at: at("2026-10-18T12:01:00Z"),
            }]
        );
        assert_eq!(
            denials[0].retry_after(now),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_next_window() {
        let limiter = limiter(1, 100);
        let caller = Caller::anonymous(ip("2001:db8::1"));
        let now = at("2026-10-18T12:00:59.999Z");

        assert!(limiter.check_at(&caller, now).await.is_allowed());
        assert!(!limiter.check_at(&caller, now).await.is_allowed());

        let next = now + TimeDelta::milliseconds(1);
        assert!(limiter.check_at(&caller, next).await.is_allowed());
    }

    #[tokio::test]
    async fn test_user_ceiling_is_independent() {
        let limiter = limiter(100, 2);
        let now = at("2026-10-18T12:00:00Z");

        // the same user from different addresses
        let first = Caller::user(Some(ip("198.51.100.1")), "user-42");
        let second = Caller::user(Some(ip("198.51.100.2")), "user-42");
        assert!(limiter.check_at(&first, now).await.is_allowed());
        assert!(limiter.check_at(&second, now).await.is_allowed());

        let decision = limiter.check_at(&first, now).await;
        let RateLimitDecision::Denied(denial) = decision else {
            panic!("expected a denial, got {decision:?}");
        };
        assert_eq!(denial.reason, DenialReason::UserLimit);

        // another user on the same address is unaffected
        let other = Caller::user(Some(ip("198.51.100.1")), "user-7");
        assert!(limiter.check_at(&other, now).await.is_allowed());
    }

    #[tokio::test]
    async fn test_disabled() {
        let mut limiter = limiter(0, 0);
        limiter.config.enabled = false;

        let caller = Caller::anonymous(ip("203.0.113.7"));
        assert!(limiter.check(&caller).await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_failure_allows() {
        let limiter = limiter_with(Arc::new(FailingStore::default()), 0, 0);

        let caller = Caller::user(Some(ip("203.0.113.7")), "user-42");
        assert!(limiter.check(&caller).await.is_allowed());
    }

    #[tokio::test]
    async fn test_huge_limits() {
        let limiter = limiter(u64::MAX, u64::MAX);

        let caller = Caller::user(Some(ip("203.0.113.7")), "user-42");
        assert!(limiter.check(&caller).await.is_allowed());
    }

    #[test]
    fn test_config() {
        let config: RateLimitConfig = serde_yaml::from_str("window: 5m
ip_limit: 10").unwrap();
        assert_eq!(
            config,
            RateLimitConfig {
                window: Duration::from_secs(300),
                ip_limit: 10,
                ..Default::default()
            }
        );

        let err = serde_yaml::from_str::<RateLimitConfig>("window: 0s").unwrap_err();
        assert!(err.to_string().contains("must not be zero"), "{err}");
    }

    #[test]
    fn test_ip_is_hashed() {
        let hashed = hash_ip(ip("203.0.113.7"));
        assert_eq!(hashed.len(), 32);
        assert!(!hashed.contains("203"));
        assert_eq!(hashed, hash_ip(ip("203.0.113.7")));
        assert_ne!(hashed, hash_ip(ip("203.0.113.8")));
    }

    #[test]
    fn test_denial_payload() {
        let denial = RateLimitDenial {
            reason: DenialReason::IpLimit,
            reset_at: at("2026-10-18T12:01:00Z"),
        };

        insta::assert_json_snapshot!(denial, @r###"
        {
          "allowed": false,
          "reason": "ip_limit",
          "resetAt": "2026-10-18T12:01:00Z"
        }
        "###);

        insta::assert_json_snapshot!(RateLimitDecision::Allowed, @r###"
        {
          "allowed": true
        }
        "###);

        assert_eq!(
            CacheError::RateLimited(denial).to_string(),
            "rate limit exceeded (ip_limit), resets at 2026-10-18T12:01:00+00:00"
        );
    }
}
