//! In-process deduplication of concurrent computations.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio_util::sync::CancellationToken;

use super::{CacheEntry, CacheError};
use crate::utils::futures::CallOnDrop;

type ComputationChannel<V> = Shared<oneshot::Receiver<CacheEntry<V>>>;

struct InFlight<V> {
    /// Tells this flight apart from later flights for the same key.
    id: u64,
    channel: ComputationChannel<V>,
    /// Number of callers still waiting for the outcome.
    waiters: usize,
    cancel: CancellationToken,
}

type FlightMap<K, V> = Arc<Mutex<BTreeMap<K, InFlight<V>>>>;

/// Runs at most one computation per key at a time.
///
/// Concurrent callers of [`run`](Self::run) with the same key share the outcome of a single
/// computation, including its error. A flight is forgotten the moment its computation finishes,
/// so this does not cache anything: a call after completion starts a fresh computation.
///
/// Every caller is counted as a waiter. When all waiters of a flight went away before it finished,
/// the flight is removed and the [`CancellationToken`] handed to its computation is cancelled.
pub struct SingleFlight<K, V> {
    name: &'static str,
    flights: FlightMap<K, V>,
    next_id: Arc<AtomicU64>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            name: self.name,
            flights: Arc::clone(&self.flights),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K, V> fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.flights.try_lock().map(|f| f.len()).unwrap_or_default();
        f.debug_struct("SingleFlight")
            .field("name", &self.name)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a coordinator, `name` is used to tag metrics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flights: Default::default(),
            next_id: Default::default(),
        }
    }

    /// The number of computations currently running.
    pub fn in_flight(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_running(&self, key: &K) -> bool {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Joins the running computation for `key`, or starts one with `computation`.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// computation on the runtime, even if the returned future is not awaited right away.
    pub fn run<F, Fut>(&self, key: K, computation: F) -> BoxFuture<'static, CacheEntry<V>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        let name = self.name;

        // Checking for and registering a flight happens under one lock, so only one caller can
        // ever start the computation for a key.
        let (id, channel) = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            match flights.get_mut(&key) {
                Some(flight) => {
                    metric!(counter("computations.channel.hit") += 1, "computation" => name);
                    flight.waiters += 1;
                    (flight.id, flight.channel.clone())
                }
                None => {
                    metric!(counter("computations.channel.miss") += 1, "computation" => name);
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let cancel = CancellationToken::new();
                    let channel = self.spawn_flight(key.clone(), id, computation(cancel.clone()));
                    flights.insert(
                        key.clone(),
                        InFlight {
                            id,
                            channel: channel.clone(),
                            waiters: 1,
                            cancel,
                        },
                    );
                    (id, channel)
                }
            }
        };

        let leave_token = {
            let flights = Arc::clone(&self.flights);
            CallOnDrop::new(move || {
                let mut flights = flights.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(flight) = flights.get_mut(&key).filter(|flight| flight.id == id) else {
                    return;
                };
                flight.waiters -= 1;
                if flight.waiters == 0 {
                    if let Some(flight) = flights.remove(&key) {
                        metric!(counter("computations.channel.abandoned") += 1, "computation" => name);
                        flight.cancel.cancel();
                    }
                }
            })
        };

        Box::pin(async move {
            let result = channel.await;
            leave_token.disarm();
            result.unwrap_or(Err(CacheError::Cancelled))
        })
    }

    /// Spawns the computation and returns a shareable channel for its outcome.
    fn spawn_flight<Fut>(&self, key: K, id: u64, computation: Fut) -> ComputationChannel<V>
    where
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let flights = Arc::clone(&self.flights);
        let remove_flight_token = CallOnDrop::new(move || {
            let mut flights = flights.lock().unwrap_or_else(PoisonError::into_inner);
            if flights.get(&key).is_some_and(|flight| flight.id == id) {
                flights.remove(&key);
            }
        });

        let flight = async move {
            let result = computation.await;
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_flight_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(flight);

        receiver.shared()
    }
}
