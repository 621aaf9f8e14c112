use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use super::artifact::{Artifact, Produced};
use super::cache_key::CacheKey;
use super::config::{ComputationConfig, ComputationType};
use super::freshness::{Freshness, FreshnessPolicy, FreshnessVerdict};
use super::rate_limit::{Caller, RateLimiter};
use super::retry::{RetryPolicy, run_with_retry};
use super::single_flight::SingleFlight;
use super::store::{StoreError, StoreService, create_store};
use super::{CacheEntry, CacheError, UpstreamError};
use crate::config::Config;
use crate::utils::futures::CallOnDrop;

/// A request for an expensive computation whose result is worth caching.
pub trait ComputationRequest: 'static + Send + Sync + Clone {
    /// The computed payload, stored as JSON.
    type Item: 'static + Send + Sync + Clone + Serialize + DeserializeOwned;

    /// The input the computation depends on, besides the reference id.
    ///
    /// Its canonical form is hashed into the cache key.
    type Context: Serialize;

    /// The schema version of [`Item`](Self::Item).
    ///
    /// Bumping it makes all previously stored artifacts unreachable.
    const VERSION: u32;

    /// The entity this computation is about, e.g. a ticker symbol.
    fn reference_id(&self) -> &str;

    fn context(&self) -> &Self::Context;

    /// Invoked to produce a fresh item, `attempt` starts at 1.
    fn compute(&self, attempt: u32) -> BoxFuture<'_, Result<Produced<Self::Item>, UpstreamError>>;

    /// Whether a failed [`compute`](Self::compute) is worth retrying.
    fn is_retryable(&self, error: &UpstreamError) -> bool {
        error.is_retryable()
    }
}

/// The answer of [`ComputationCache::get_or_compute`].
#[derive(Debug, Clone)]
pub struct Computed<T> {
    pub key: CacheKey,
    pub artifact: Arc<Artifact<T>>,
    /// The freshness of `artifact` at the time it was handed out.
    pub verdict: FreshnessVerdict,
    /// Refreshing `artifact` failed, and it is served in place of a fresh one.
    pub degraded: bool,
}

impl<T> Computed<T> {
    pub fn payload(&self) -> &T {
        &self.artifact.payload
    }
}

impl<T: Serialize> Serialize for Computed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Flat<'a, T> {
            key: &'a str,
            #[serde(flatten)]
            artifact: &'a Artifact<T>,
            #[serde(flatten)]
            verdict: &'a FreshnessVerdict,
            degraded: bool,
        }

        Flat {
            key: self.key.as_str(),
            artifact: &self.artifact,
            verdict: &self.verdict,
            degraded: self.degraded,
        }
        .serialize(serializer)
    }
}

/// Serves computations of one [`ComputationType`] from the store, computing them as needed.
///
/// Concurrent requests for the same key are coalesced twice: once for the whole lookup, and once
/// for the upstream computation, which soft-stale refreshes running in the background join as
/// well.
pub struct ComputationCache<R: ComputationRequest> {
    computation: ComputationType,
    policy: FreshnessPolicy,
    retry: RetryPolicy,
    store: StoreService,
    rate_limiter: Option<Arc<RateLimiter>>,

    /// Remaining slots for background refreshes.
    max_lazy_refreshes: Arc<AtomicIsize>,

    /// Deduplicates concurrent lookups.
    lookups: SingleFlight<CacheKey, Computed<R::Item>>,
    /// Deduplicates concurrent upstream computations.
    computations: SingleFlight<CacheKey, Arc<Artifact<R::Item>>>,
}

impl<R: ComputationRequest> std::fmt::Debug for ComputationCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCache")
            .field("computation", &self.computation)
            .field("policy", &self.policy)
            .field("retry", &self.retry)
            .field("store", &self.store)
            .field("rate_limited", &self.rate_limiter.is_some())
            .field("max_lazy_refreshes", &self.max_lazy_refreshes)
            .field("lookups", &self.lookups)
            .field("computations", &self.computations)
            .finish()
    }
}

impl<R: ComputationRequest> Clone for ComputationCache<R> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            computation: self.computation,
            policy: self.policy,
            retry: self.retry,
            store: self.store.clone(),
            rate_limiter: self.rate_limiter.clone(),
            max_lazy_refreshes: Arc::clone(&self.max_lazy_refreshes),
            lookups: self.lookups.clone(),
            computations: self.computations.clone(),
        }
    }
}

impl<R: ComputationRequest> ComputationCache<R> {
    pub fn new(
        computation: ComputationType,
        config: &ComputationConfig,
        store: StoreService,
        retry: RetryPolicy,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self::with_lazy_budget(
            computation,
            config.policy,
            Arc::new(AtomicIsize::new(config.max_lazy_refreshes)),
            store,
            retry,
            rate_limiter,
        )
    }

    fn with_lazy_budget(
        computation: ComputationType,
        policy: FreshnessPolicy,
        max_lazy_refreshes: Arc<AtomicIsize>,
        store: StoreService,
        retry: RetryPolicy,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        let name = computation.as_str();
        Self {
            computation,
            policy,
            retry,
            store,
            rate_limiter,
            max_lazy_refreshes,
            lookups: SingleFlight::new(name),
            computations: SingleFlight::new(name),
        }
    }

    pub fn computation(&self) -> ComputationType {
        self.computation
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// The key an artifact for `reference_id` and `context` is stored under.
    pub fn cache_key(&self, reference_id: &str, context: &R::Context) -> CacheEntry<CacheKey> {
        CacheKey::for_context(self.computation, reference_id, R::VERSION, context)
    }

    /// Returns the artifact for `request`, computing it if necessary.
    ///
    /// This first counts the request against the rate limits of `caller`. Then:
    /// - A fresh stored artifact is returned as is.
    /// - A soft-stale artifact is returned as is, and refreshed in the background.
    /// - Otherwise, a new artifact is computed, stored and returned. If that fails after all
    ///   retries and a hard-stale artifact exists, that one is returned flagged as `degraded`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::RateLimited`] if `caller` exceeded a ceiling.
    /// - [`CacheError::UnsupportedValue`] if the request context cannot be hashed.
    /// - [`CacheError::ProducerFailed`] if no artifact could be served.
    /// - [`CacheError::Cancelled`] if the computation was aborted.
    pub async fn get_or_compute(
        &self,
        caller: &Caller,
        request: R,
    ) -> CacheEntry<Computed<R::Item>> {
        let name = self.computation.as_str();
        metric!(counter("computations.access") += 1, "computation" => name);

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.check(caller).await.into_result()?;
        }

        let key = self.cache_key(request.reference_id(), request.context())?;

        let this = self.clone();
        let lookup_key = key.clone();
        self.lookups
            .run(key, move |cancel| {
                this.lookup_or_compute(request, lookup_key, cancel)
            })
            .await
    }

    /// Deletes the stored artifact for `reference_id` and `context`.
    ///
    /// Returns whether there was one.
    pub async fn invalidate(&self, reference_id: &str, context: &R::Context) -> CacheEntry<bool> {
        let key = self.cache_key(reference_id, context)?;
        let deleted = self.store.delete(key.as_str()).await?;
        tracing::debug!(%key, deleted, "Invalidated artifact");
        Ok(deleted)
    }

    /// Looks the artifact up in the store, and computes it if it is missing or too old.
    async fn lookup_or_compute(
        self,
        request: R,
        key: CacheKey,
        cancel: CancellationToken,
    ) -> CacheEntry<Computed<R::Item>> {
        let name = self.computation.as_str();

        let previous = match self.load(&key).await {
            Some(artifact) => {
                let verdict = self.policy.classify(artifact.produced_at, Utc::now());
                tracing::trace!(%key, freshness = verdict.freshness.as_str(), "Found artifact");
                metric!(
                    counter("computations.store.hit") += 1,
                    "computation" => name,
                    "freshness" => verdict.freshness.as_str(),
                );

                match verdict.freshness {
                    Freshness::Fresh => return Ok(self.computed(key, artifact, verdict, false)),
                    Freshness::SoftStale => {
                        self.spawn_refresh(request, key.clone());
                        return Ok(self.computed(key, artifact, verdict, false));
                    }
                    Freshness::HardStale => Some(artifact),
                }
            }
            None => {
                metric!(counter("computations.store.miss") += 1, "computation" => name);
                None
            }
        };

        let computation = self.compute_memoized(request, key.clone());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = computation => result,
        };

        match (result, previous) {
            (Ok(artifact), _) => {
                let verdict = self.policy.classify(artifact.produced_at, Utc::now());
                Ok(self.computed(key, artifact, verdict, false))
            }
            (Err(err @ CacheError::ExhaustedRetries { .. }), Some(previous)) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Refresh failed, serving stale artifact"
                );
                if let CacheError::ExhaustedRetries { cause, .. } = &err {
                    metric!(
                        counter("computations.degraded") += 1,
                        "computation" => name,
                        "errdetails" => cause.metrics_tag(),
                    );
                }
                let verdict = self.policy.classify(previous.produced_at, Utc::now());
                Ok(self.computed(key, previous, verdict, true))
            }
            (Err(CacheError::Cancelled), _) => Err(CacheError::Cancelled),
            (Err(err), _) => {
                metric!(
                    counter("computations.failed") += 1,
                    "computation" => name,
                    "errdetails" => err.metrics_tag(),
                );
                Err(CacheError::ProducerFailed(Box::new(err)))
            }
        }
    }

    fn computed(
        &self,
        key: CacheKey,
        artifact: Arc<Artifact<R::Item>>,
        verdict: FreshnessVerdict,
        degraded: bool,
    ) -> Computed<R::Item> {
        Computed {
            key,
            artifact,
            verdict,
            degraded,
        }
    }

    /// Reads and decodes the stored artifact.
    ///
    /// An unreachable store and an undecodable artifact are both treated as absent.
    async fn load(&self, key: &CacheKey) -> Option<Arc<Artifact<R::Item>>> {
        let name = self.computation.as_str();

        let data = match self.store.get(key.as_str()).await {
            Ok(data) => data?,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Store unavailable, computing without it"
                );
                metric!(
                    counter("computations.store.unavailable") += 1,
                    "computation" => name,
                    "operation" => "get",
                );
                return None;
            }
        };

        match Artifact::decode(&data) {
            Ok(artifact) => Some(Arc::new(artifact)),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Discarding undecodable artifact"
                );
                metric!(counter("computations.store.malformed") += 1, "computation" => name);
                None
            }
        }
    }

    /// Joins or starts the upstream computation for `key`.
    fn compute_memoized(
        &self,
        request: R,
        key: CacheKey,
    ) -> BoxFuture<'static, CacheEntry<Arc<Artifact<R::Item>>>> {
        let this = self.clone();
        let compute_key = key.clone();
        self.computations.run(key, move |cancel| async move {
            this.compute(request, compute_key, cancel).await
        })
    }

    /// Runs the producer with retries and persists its output.
    ///
    /// This does not deduplicate concurrent computations, see [`Self::compute_memoized`].
    async fn compute(
        &self,
        request: R,
        key: CacheKey,
        cancel: CancellationToken,
    ) -> CacheEntry<Arc<Artifact<R::Item>>> {
        let name = self.computation.as_str();
        metric!(counter("computations.compute") += 1, "computation" => name);

        let start = Instant::now();
        let produced = run_with_retry(
            name,
            &self.retry,
            &cancel,
            |err| request.is_retryable(err),
            |attempt| request.compute(attempt),
        )
        .await;
        metric!(timer("computations.compute.duration") = start.elapsed(), "computation" => name);
        let produced = produced?;

        let artifact = Arc::new(Artifact::new(produced, Utc::now()));
        self.persist(&key, &artifact).await;
        Ok(artifact)
    }

    /// Writes `artifact` to the store, expiring with the hard threshold.
    ///
    /// Failures are logged and otherwise ignored, the artifact is still served from memory.
    async fn persist(&self, key: &CacheKey, artifact: &Artifact<R::Item>) {
        let name = self.computation.as_str();

        let data = match artifact.encode() {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(error = &err as &dyn std::error::Error, %key, "Failed to encode artifact");
                return;
            }
        };

        tracing::trace!(%key, "Storing artifact");
        match self.store.set(key.as_str(), data, self.policy.hard()).await {
            Ok(()) => {
                metric!(counter("computations.store.write") += 1, "computation" => name);
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Store unavailable, artifact is not persisted"
                );
                metric!(
                    counter("computations.store.unavailable") += 1,
                    "computation" => name,
                    "operation" => "set",
                );
            }
        }
    }

    /// Refreshes the artifact at `key` in the background.
    ///
    /// Nothing happens if a computation for `key` is already running, or when the budget of
    /// concurrent background refreshes is used up.
    fn spawn_refresh(&self, request: R, key: CacheKey) {
        let name = self.computation.as_str();

        if self.computations.is_running(&key) {
            return;
        }

        // We count down towards zero, and if we reach or surpass it, we will stop here.
        let max_lazy_refreshes = Arc::clone(&self.max_lazy_refreshes);
        if max_lazy_refreshes.fetch_sub(1, Ordering::Relaxed) <= 0 {
            max_lazy_refreshes.fetch_add(1, Ordering::Relaxed);

            metric!(counter("computations.lazy_limit_hit") += 1, "computation" => name);
            return;
        }

        let done_token = CallOnDrop::new(move || {
            max_lazy_refreshes.fetch_add(1, Ordering::Relaxed);
        });

        tracing::trace!(%key, "Spawning background refresh");
        metric!(counter("computations.refresh") += 1, "computation" => name);

        // The spawned task is a waiter of its own, so callers going away never cancel it.
        let computation = self.compute_memoized(request, key.clone());
        let task = async move {
            let _done_token = done_token; // move into the future

            if let Err(err) = computation.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Background refresh failed"
                );
            }
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

/// Caches handed out by [`Computations`], by computation type and request type.
type CacheMap = BTreeMap<(ComputationType, TypeId), Arc<dyn Any + Send + Sync>>;

/// The shared pieces that all [`ComputationCache`]s are built from.
///
/// This replaces process-wide singletons: create it once from the [`Config`], and get the caches
/// from it.
#[derive(Debug, Clone)]
pub struct Computations {
    store: StoreService,
    rate_limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    configs: BTreeMap<ComputationType, (ComputationConfig, Arc<AtomicIsize>)>,
    caches: Arc<Mutex<CacheMap>>,
}

impl Computations {
    /// Connects to the configured store and sets up the rate limiter.
    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        let store = create_store(&config.store).await?;
        let store = StoreService::new(store, config.store.timeout, config.store_retry);
        Ok(Self::new(store, config))
    }

    /// Uses the given `store` instead of the configured one.
    pub fn new(store: StoreService, config: &Config) -> Self {
        let rate_limiter = config
            .rate_limits
            .enabled
            .then(|| Arc::new(RateLimiter::new(store.clone(), config.rate_limits.clone())));

        let configs = ComputationType::ALL
            .into_iter()
            .map(|computation| {
                let cfg = *config.computations.get(computation);
                let budget = Arc::new(AtomicIsize::new(cfg.max_lazy_refreshes));
                (computation, (cfg, budget))
            })
            .collect();

        Self {
            store,
            rate_limiter,
            retry: config.retry,
            configs,
            caches: Default::default(),
        }
    }

    pub fn store(&self) -> &StoreService {
        &self.store
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Returns the cache for one computation type.
    ///
    /// All calls with the same computation type and request type return clones of the same cache,
    /// so their requests are coalesced with each other. The background refresh budget is shared by
    /// all caches of a computation type.
    pub fn cache<R: ComputationRequest>(&self, computation: ComputationType) -> ComputationCache<R> {
        let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (computation, TypeId::of::<R>());

        if let Some(cache) = caches
            .get(&key)
            .and_then(|cache| cache.downcast_ref::<ComputationCache<R>>())
        {
            return cache.clone();
        }

        // `new` registers every computation type
        let (config, budget) = &self.configs[&computation];
        let cache = ComputationCache::<R>::with_lazy_budget(
            computation,
            config.policy,
            Arc::clone(budget),
            self.store.clone(),
            self.retry,
            self.rate_limiter.clone(),
        );
        caches.insert(key, Arc::new(cache.clone()));
        cache
    }
}
