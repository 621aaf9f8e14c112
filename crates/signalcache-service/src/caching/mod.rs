//! # Signalcache caching infrastructure
//!
//! Producing an oracle card, a pulse card or an LLM reasoning is slow and costs money, while the
//! result stays useful for a while. This module serves such computations from a durable store,
//! recomputes them as they age, and keeps concurrent callers from triggering duplicate work.
//!
//! ## Request flow
//!
//! A request to a [`ComputationCache`] goes through the following steps:
//! - It is counted against the rate limits of its [`Caller`]. Denied requests fail with
//!   [`CacheError::RateLimited`].
//! - Its [`CacheKey`] is derived from the computation type, the reference id, the payload version
//!   and the [`ContentHash`] of the canonical request context.
//! - Concurrent requests for the same key are coalesced into one lookup.
//! - The stored [`Artifact`] is loaded and classified by its age into a [`Freshness`] tier:
//!   - `fresh`: returned as is.
//!   - `soft_stale`: returned as is, while a refresh runs in the background.
//!   - `hard_stale` or missing: a new artifact is computed, stored and returned.
//! - The upstream computation is retried with exponential backoff according to the
//!   [`RetryPolicy`]. When it is exhausted and a hard-stale artifact exists, that artifact is
//!   served flagged as `degraded`.
//!
//! Computations are coalesced separately from lookups, so a request that needs a fresh artifact
//! joins a background refresh that is already running for the same key.
//!
//! ## Store
//!
//! The [`Store`](store::Store) is a small key-value contract with per-entry expiry, implemented
//! in memory and, with the `redis` feature, on top of Redis. Every round trip goes through the
//! [`StoreService`], which bounds it with a timeout and retries it. If the store is unavailable,
//! lookups behave like misses and writes are skipped, so requests are still answered.
//!
//! Artifacts are stored with the `hard` threshold of their computation type as expiry.
//!
//! ### Metrics
//!
//! Every metric of the request flow is tagged with a `computation` field:
//!
//! - `computations.access`: All accesses.
//! - `computations.channel.hit` / `computations.channel.miss`: Requests joining / starting a flight.
//! - `computations.store.hit`: Artifacts found in the store, additionally tagged by `freshness`.
//! - `computations.store.miss`: Artifacts not found in the store.
//! - `computations.compute`: Actual upstream computations.
//! - `computations.refresh`: Background refreshes of soft-stale artifacts.
//! - `computations.lazy_limit_hit`: Skipped background refreshes.
//! - `computations.degraded`: Hard-stale artifacts served because the refresh failed.
//!
//! ## Configuration
//!
//! [`Config::computations`](crate::config::Config::computations) holds the `soft` and `hard`
//! thresholds of each computation type, and the limit on concurrent background refreshes. The
//! limit applies to each computation type as a whole.

mod artifact;
mod cache_error;
mod cache_key;
mod canonical;
mod computation;
mod config;
mod freshness;
mod rate_limit;
mod retry;
mod single_flight;
pub mod store;

pub use artifact::{Artifact, ArtifactSource, Produced};
pub use cache_error::{CacheEntry, CacheError, UpstreamError};
pub use cache_key::{CacheKey, InvalidCacheKey};
pub use canonical::{ContentHash, canonicalize, content_hash};
pub use computation::{ComputationCache, ComputationRequest, Computations, Computed};
pub use config::{ComputationConfig, ComputationConfigs, ComputationType, UnknownComputationType};
pub use freshness::{Freshness, FreshnessPolicy, FreshnessVerdict, InvalidPolicy, classify};
pub use rate_limit::{
    Caller, DenialReason, RateLimitConfig, RateLimitDecision, RateLimitDenial, RateLimiter,
};
pub use retry::{RetryError, RetryPolicy, run_with_retry};
pub use single_flight::SingleFlight;
pub use store::{StoreError, StoreService};
