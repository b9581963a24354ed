//! Integration tests for the coalescing resolver
//!
//! Exercises cache hits, expiry, coalescing of concurrent misses, independence
//! of keys, uncached failures and the background sweep through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;
use weather_cache::cache::{Fetcher, ResolveError, Resolver};
use weather_cache::data::WeatherReport;

#[derive(Debug, Error)]
#[error("upstream timed out")]
struct UpstreamTimeout;

/// Fetcher that counts calls, waits `delay`, and optionally fails
#[derive(Clone)]
struct MockUpstream {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl MockUpstream {
    fn new(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
            fail: false,
        }
    }

    fn failing(delay: Duration) -> Self {
        Self {
            fail: true,
            ..Self::new(delay)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockUpstream {
    type Value = WeatherReport;
    type Error = UpstreamTimeout;

    async fn fetch(&self, city: &str) -> Result<WeatherReport, UpstreamTimeout> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(UpstreamTimeout);
        }
        Ok(WeatherReport {
            city: city.to_string(),
            temperature: 22.0,
            description: "Sunny".to_string(),
            timestamp: call,
        })
    }
}

/// Fetcher that only returns once two fetches are running at the same time
#[derive(Clone)]
struct RendezvousUpstream {
    barrier: Arc<Barrier>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Fetcher for RendezvousUpstream {
    type Value = String;
    type Error = UpstreamTimeout;

    async fn fetch(&self, city: &str) -> Result<String, UpstreamTimeout> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.barrier.wait().await;
        Ok(city.to_uppercase())
    }
}

#[tokio::test]
async fn test_hit_bypasses_fetch() {
    let upstream = MockUpstream::new(Duration::ZERO);
    let resolver = Resolver::new(upstream.clone(), Duration::from_secs(5));

    let first = resolver.resolve("Paris").await.unwrap();
    let second = resolver.resolve("Paris").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(upstream.calls(), 1, "Second lookup should be served from cache");
}

#[tokio::test]
async fn test_expiry_forces_refetch() {
    // TTL=100ms: a lookup at 50ms is a hit, a lookup at 150ms refetches
    let upstream = MockUpstream::new(Duration::ZERO);
    let resolver = Resolver::new(upstream.clone(), Duration::from_millis(100));

    let initial = resolver.resolve("Paris").await.unwrap();
    assert_eq!(upstream.calls(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(resolver.resolve("Paris").await.unwrap(), initial);
    assert_eq!(upstream.calls(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let refreshed = resolver.resolve("Paris").await.unwrap();
    assert_eq!(upstream.calls(), 2);
    assert_eq!(refreshed.timestamp, 2, "Should return the new fetch's result");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_coalesce_into_one_fetch() {
    let upstream = MockUpstream::new(Duration::from_millis(200));
    let resolver = Resolver::new(upstream.clone(), Duration::from_secs(5));

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve("Berlin").await })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;

    assert_eq!(upstream.calls(), 1);
    let reports: Vec<WeatherReport> = results
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("resolve failed"))
        .collect();
    assert!(reports.iter().all(|report| report == &reports[0]));
    assert_eq!(resolver.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_independent_keys_fetch_concurrently() {
    let upstream = RendezvousUpstream {
        barrier: Arc::new(Barrier::new(2)),
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let resolver = Resolver::new(upstream.clone(), Duration::from_secs(5));

    // Each fetch waits for the other, so this only completes if both run at once
    let both = async { tokio::join!(resolver.resolve("Kyiv"), resolver.resolve("Lima")) };
    let (kyiv, lima) = tokio::time::timeout(Duration::from_secs(2), both)
        .await
        .expect("Fetches for different keys should not block each other");

    assert_eq!(kyiv.unwrap(), "KYIV");
    assert_eq!(lima.unwrap(), "LIMA");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failure_is_shared_and_not_cached() {
    let upstream = MockUpstream::failing(Duration::from_millis(50));
    let resolver = Resolver::new(upstream.clone(), Duration::from_secs(5));

    let (a, b, c) = tokio::join!(
        resolver.resolve("Madrid"),
        resolver.resolve("Madrid"),
        resolver.resolve("Madrid")
    );
    assert_eq!(upstream.calls(), 1);
    for result in [a, b, c] {
        assert!(matches!(result, Err(ResolveError::Upstream(_))));
    }

    let retry = resolver.resolve("Madrid").await;
    assert!(retry.is_err());
    assert_eq!(upstream.calls(), 2, "A failed fetch must not be cached");
}

#[tokio::test]
async fn test_stale_entry_refetched_before_and_after_sweep() {
    let upstream = MockUpstream::new(Duration::ZERO);
    let resolver = Resolver::new(upstream.clone(), Duration::from_millis(40));
    let shutdown = CancellationToken::new();

    resolver.resolve("Oslo").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // No sweep has run yet; the stale entry must still count as a miss
    resolver.resolve("Oslo").await.unwrap();
    assert_eq!(upstream.calls(), 2);

    let sweep = resolver.start_background_sweep(Duration::from_millis(20), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Entry has expired and been swept; lookup still refetches
    resolver.resolve("Oslo").await.unwrap();
    assert_eq!(upstream.calls(), 3);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), sweep)
        .await
        .expect("Sweep should stop when cancelled")
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_caller_returns_cancelled_while_others_get_value() {
    let upstream = MockUpstream::new(Duration::from_millis(100));
    let resolver = Resolver::new(upstream.clone(), Duration::from_secs(5));
    let cancel = CancellationToken::new();
    let give_up = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    };

    let (cancelled, waited, ()) = tokio::join!(
        resolver.resolve_with_cancel("Rome", &cancel),
        resolver.resolve("Rome"),
        give_up
    );

    assert!(matches!(cancelled, Err(ResolveError::Cancelled)));
    assert_eq!(waited.unwrap().city, "Rome");
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_resolvers_are_independent() {
    let upstream = MockUpstream::new(Duration::ZERO);
    let first = Resolver::new(upstream.clone(), Duration::from_secs(5));
    let second = Resolver::new(upstream.clone(), Duration::from_secs(5));

    first.resolve("Vienna").await.unwrap();
    second.resolve("Vienna").await.unwrap();

    assert_eq!(upstream.calls(), 2);
}
