//! In-memory key-value store with per-entry expiry
//!
//! Entries are considered live until their expiry instant passes. Expiry is
//! checked on every read, so a stale entry is never returned even if the
//! background sweep has not yet reclaimed it. The sweep only frees memory.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// TTL used when the configured value is zero or cannot be parsed
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3 * 60);

/// How often the background sweep scans for expired entries
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A stored value together with the instant it stops being fresh
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe map from key to the latest fetched value, with a fixed TTL
///
/// Reads take a shared lock and writes an exclusive one. No lock is ever held
/// across an `.await`.
#[derive(Debug)]
pub struct ExpiringStore<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
}

impl<V> ExpiringStore<V> {
    /// Creates an empty store whose entries live for `ttl`
    ///
    /// A zero `ttl` would make every entry expire on write, so it is replaced
    /// with [`DEFAULT_CACHE_TTL`].
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() {
            warn!(default = ?DEFAULT_CACHE_TTL, "Cache TTL must be positive, using default");
            DEFAULT_CACHE_TTL
        } else {
            ttl
        };

        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// The TTL applied to every write
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // A panic while holding the lock cannot leave a half-written entry behind,
    // so a poisoned lock is still safe to use.
    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` under `key`, replacing any previous entry and restarting its TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.write_entries().insert(key.into(), entry);
    }

    /// Number of physically stored entries, including stale ones not yet swept
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry whose expiry has passed
    ///
    /// Candidates are collected under the shared lock so readers are not
    /// starved during a large scan; the exclusive lock is only taken for the
    /// removals. Each candidate is checked again before removal because a
    /// concurrent `set` may have refreshed it in between.
    ///
    /// # Returns
    /// The number of entries removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();

        let expired = self.expired_keys(now);
        if expired.is_empty() {
            return 0;
        }

        let removed = self.remove_expired(&expired, now);
        if removed > 0 {
            info!(removed, "Cache sweep removed expired entries");
        }
        removed
    }

    fn expired_keys(&self, now: Instant) -> Vec<String> {
        self.read_entries()
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn remove_expired(&self, candidates: &[String], now: Instant) -> usize {
        let mut entries = self.write_entries();
        let mut removed = 0;
        for key in candidates {
            if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
                entries.remove(key);
                removed += 1;
            }
        }
        removed
    }
}

impl<V: Clone> ExpiringStore<V> {
    /// Returns the value for `key` if present and not yet expired
    ///
    /// Stale entries are reported as absent but left in place for the sweep.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.read_entries()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }
}

impl<V: Send + Sync + 'static> ExpiringStore<V> {
    /// Spawns a task that sweeps the store every `interval` until `shutdown` is cancelled
    ///
    /// # Arguments
    /// * `interval` - Time between sweeps; zero falls back to [`DEFAULT_SWEEP_INTERVAL`]
    /// * `shutdown` - Token whose cancellation stops the task
    ///
    /// # Returns
    /// The handle of the sweep task, which completes shortly after cancellation
    pub fn start_background_sweep(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            interval
        };
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first tick (immediate)
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        debug!(removed, remaining = store.len(), "Cache sweep finished");
                    }
                    _ = shutdown.cancelled() => {
                        info!("Cache sweep stopped");
                        break;
                    }
                }
            }
        })
    }
}
