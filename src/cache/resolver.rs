//! Cache-or-fetch resolution with request coalescing
//!
//! A [`Resolver`] answers lookups from its [`ExpiringStore`] and, on a miss,
//! makes sure only one upstream fetch per key is in flight at a time. Every
//! caller that misses while a fetch (a "wave") is running waits for that
//! wave's outcome instead of starting its own.
//!
//! Waves run as detached tasks. Callers only hold a receiver for the outcome,
//! so a caller that gives up, including the one that started the wave, never
//! cancels the fetch for everyone else.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::store::ExpiringStore;

/// Upstream source the resolver calls on a cache miss
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Payload cached per key
    type Value: Clone + Send + Sync + 'static;
    /// Failure reported by the upstream, passed through to callers untouched
    type Error: std::error::Error + Send + Sync + 'static;

    async fn fetch(&self, key: &str) -> Result<Self::Value, Self::Error>;
}

/// Errors returned by [`Resolver::resolve`]
#[derive(Debug, Error)]
pub enum ResolveError<E> {
    /// The upstream fetch for this wave failed; every caller of the wave shares the same error
    #[error("upstream fetch failed: {0}")]
    Upstream(Arc<E>),

    /// The caller's own cancellation token fired while it was waiting
    #[error("caller cancelled while waiting for the fetch")]
    Cancelled,

    /// The wave ended without an outcome (the fetch panicked)
    #[error("fetch aborted before producing a result")]
    WaveAborted,
}

impl<E> Clone for ResolveError<E> {
    fn clone(&self) -> Self {
        match self {
            ResolveError::Upstream(err) => ResolveError::Upstream(Arc::clone(err)),
            ResolveError::Cancelled => ResolveError::Cancelled,
            ResolveError::WaveAborted => ResolveError::WaveAborted,
        }
    }
}

type Outcome<F> = Result<<F as Fetcher>::Value, ResolveError<<F as Fetcher>::Error>>;

/// `None` until the wave settles
type WaveReceiver<F> = watch::Receiver<Option<Outcome<F>>>;

struct Inner<F: Fetcher> {
    fetcher: F,
    store: Arc<ExpiringStore<F::Value>>,
    in_flight: Mutex<HashMap<String, WaveReceiver<F>>>,
}

/// Serves values from the cache and coalesces concurrent misses into one fetch per key
///
/// Cloning is cheap; clones share the same store and in-flight registry.
/// Separately constructed resolvers are fully independent.
pub struct Resolver<F: Fetcher> {
    inner: Arc<Inner<F>>,
}

impl<F: Fetcher> Clone for Resolver<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Fetcher> Resolver<F> {
    /// Creates a resolver with an empty store whose entries live for `ttl`
    pub fn new(fetcher: F, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                store: Arc::new(ExpiringStore::new(ttl)),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// TTL applied to fetched values
    pub fn ttl(&self) -> Duration {
        self.inner.store.ttl()
    }

    /// Number of keys with a fetch currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    /// Starts the periodic sweep of expired entries; see [`ExpiringStore::start_background_sweep`]
    pub fn start_background_sweep(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        self.inner.store.start_background_sweep(interval, shutdown)
    }

    /// Returns the cached value for `key`, fetching it from upstream on a miss
    ///
    /// Dropping the returned future only stops this caller from waiting; the
    /// fetch keeps running and still populates the cache.
    pub async fn resolve(&self, key: &str) -> Outcome<F> {
        if let Some(value) = self.cached(key) {
            return Ok(value);
        }

        let mut wave = self.join_or_lead(key);
        wait_for_outcome::<F>(&mut wave).await
    }

    /// Like [`resolve`](Self::resolve), but gives up with [`ResolveError::Cancelled`] once `cancel` fires
    ///
    /// A cache hit is returned even if `cancel` has already fired; the token
    /// only interrupts waiting on a fetch. Cancellation is local to this
    /// caller; other callers waiting on the same fetch are unaffected.
    pub async fn resolve_with_cancel(&self, key: &str, cancel: &CancellationToken) -> Outcome<F> {
        if let Some(value) = self.cached(key) {
            return Ok(value);
        }

        let mut wave = self.join_or_lead(key);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key, "Caller cancelled");
                Err(ResolveError::Cancelled)
            }
            outcome = wait_for_outcome::<F>(&mut wave) => outcome,
        }
    }

    fn cached(&self, key: &str) -> Option<F::Value> {
        let value = self.inner.store.get(key);
        if value.is_some() {
            debug!(key, "Cache hit");
        } else {
            debug!(key, "Cache miss");
        }
        value
    }

    /// Subscribes to the in-flight wave for `key`, starting one if none exists
    fn join_or_lead(&self, key: &str) -> WaveReceiver<F> {
        let mut in_flight = self.inner.lock_in_flight();
        if let Some(wave) = in_flight.get(key) {
            trace!(key, "Joining in-flight fetch");
            return wave.clone();
        }

        let (sender, receiver) = watch::channel(None);
        in_flight.insert(key.to_string(), receiver.clone());
        drop(in_flight);

        trace!(key, "Leading new fetch");
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            inner.run_wave(key, sender).await;
        });

        receiver
    }
}

impl<F: Fetcher> Inner<F> {
    // The registry is only touched in short, non-async sections, so a poisoned
    // lock still holds a consistent map.
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, WaveReceiver<F>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches `key` (unless a previous wave just cached it), then settles the wave
    async fn run_wave(&self, key: String, sender: watch::Sender<Option<Outcome<F>>>) {
        let outcome = AssertUnwindSafe(self.fetch_and_commit(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(key = %key, "Fetch panicked");
                Err(ResolveError::WaveAborted)
            });

        // Release the slot and publish under one lock so that nobody can
        // join a wave that has already settled.
        let mut in_flight = self.lock_in_flight();
        in_flight.remove(&key);
        sender.send_replace(Some(outcome));
    }

    async fn fetch_and_commit(&self, key: &str) -> Outcome<F> {
        // A wave that finished just before this one registered may already
        // have cached the value.
        if let Some(value) = self.store.get(key) {
            trace!(key, "Value cached by previous fetch, skipping upstream");
            return Ok(value);
        }

        match self.fetcher.fetch(key).await {
            Ok(value) => {
                self.store.set(key, value.clone());
                debug!(key, "Fetched and cached");
                Ok(value)
            }
            Err(err) => {
                warn!(key, error = %err, "Upstream fetch failed");
                Err(ResolveError::Upstream(Arc::new(err)))
            }
        }
    }
}

async fn wait_for_outcome<F: Fetcher>(wave: &mut WaveReceiver<F>) -> Outcome<F> {
    let settled = match wave.wait_for(Option::is_some).await {
        Ok(outcome) => Option::clone(&outcome),
        // Sender dropped without publishing, e.g. the runtime shut down mid-wave
        Err(_) => None,
    };
    settled.unwrap_or(Err(ResolveError::WaveAborted))
}
