//! Keyed request store with single-flight fetches and generation guards
//!
//! Every state transition (entry creation, generation bump, in-flight
//! registration, commit, removal) happens while holding the entry's
//! `DashMap` guard, and no guard is ever held across an `.await`. The fetch
//! itself runs in a spawned task so it completes (and commits) even when
//! every caller that asked for it has gone away.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt as _;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::DEFAULT_TTL;
use super::entry::{
    CacheEntry, Completion, CompletionStatus, EntrySnapshot, FetchFn, InFlight, Outcome,
    SharedFetch,
};
use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::Error;

const EVENT_CAPACITY: usize = 256;

/// Notification broadcast to subscribers of a store.
///
/// Events only name the fetch; use [`RequestCache::current`] to join it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A new fetch generation started for `key`
    FetchStarted {
        /// Cache key
        key: String,
        /// Generation of the new fetch
        generation: u64,
    },
}

/// A fetch the caller has to wait for
pub struct Pending<V> {
    /// Previously committed value, served while the fetch runs
    pub stale: Option<V>,
    /// Generation of the fetch being awaited
    pub generation: u64,
    /// Shared completion of the fetch
    pub completion: SharedFetch<V>,
}

/// Synchronous answer to a request
pub enum Lookup<V> {
    /// The entry is fresh; no fetch was started
    Fresh(V),
    /// A fetch is running (started or joined by this call)
    Pending(Pending<V>),
}

/// Value returned by [`RequestCache::fetch`]
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<V> {
    /// The value
    pub value: V,
    /// Whether it was served from a fresh entry without waiting
    pub from_cache: bool,
}

/// Latest state of a key's fetches
pub enum Current<V> {
    /// The newest generation is still running
    Running(Pending<V>),
    /// The newest generation completed with `outcome`
    Settled {
        /// Generation that committed
        generation: u64,
        /// Committed value or failure
        outcome: Outcome<V>,
    },
}

struct Inner<V> {
    entries: DashMap<String, CacheEntry<V>>,
    next_generation: AtomicU64,
    default_ttl: Duration,
    stats: CacheStats,
    events: broadcast::Sender<CacheEvent>,
}

/// Keyed cache of asynchronous fetch results.
///
/// Cloning is cheap; clones share the same entries.
pub struct RequestCache<V = Value> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for RequestCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for RequestCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RequestCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty store using [`DEFAULT_TTL`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_TTL)
    }

    /// Create an empty store with a custom default TTL
    #[must_use]
    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                next_generation: AtomicU64::new(0),
                default_ttl,
                stats: CacheStats::default(),
                events,
            }),
        }
    }

    /// TTL used when a caller passes `None`
    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Answer a request for `key` without waiting.
    ///
    /// Returns the entry's data if it is younger than `ttl`. Otherwise joins
    /// the in-flight fetch for the key, or starts one with `fetch` when none
    /// is running. Must be called inside a tokio runtime.
    pub fn lookup(&self, key: &str, fetch: &FetchFn<V>, ttl: Option<Duration>) -> Lookup<V> {
        let ttl = ttl.unwrap_or(self.inner.default_ttl);
        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(ttl));
        entry.fetcher = Some(Arc::clone(fetch));

        if let Some(data) = entry.fresh_data(ttl) {
            self.inner.stats.record_hit();
            trace!(key, "Cache hit");
            return Lookup::Fresh(data);
        }

        if let Some(in_flight) = &entry.in_flight {
            self.inner.stats.record_join();
            trace!(key, generation = in_flight.generation, "Joining in-flight fetch");
            return Lookup::Pending(Pending {
                stale: entry.data.clone(),
                generation: in_flight.generation,
                completion: in_flight.future.clone(),
            });
        }

        self.inner.stats.record_miss();
        entry.ttl = ttl;
        let (generation, completion) = Inner::start(&self.inner, key, &mut entry, Arc::clone(fetch));
        Lookup::Pending(Pending {
            stale: entry.data.clone(),
            generation,
            completion,
        })
    }

    /// Wait for a pending fetch.
    ///
    /// When the awaited fetch was superseded, follows the newest fetch for
    /// the key instead, so the caller always ends up with the value that
    /// was actually committed.
    pub async fn settle(&self, key: &str, mut completion: SharedFetch<V>) -> Outcome<V> {
        loop {
            let done = completion.await;
            if done.status != CompletionStatus::Superseded {
                return done.result;
            }
            match self.current(key) {
                Some(Current::Settled { outcome, .. }) => return outcome,
                Some(Current::Running(next)) => {
                    trace!(key, superseded = done.generation, "Following newer fetch");
                    completion = next.completion;
                }
                None => return done.result,
            }
        }
    }

    /// Lookup and, if needed, wait for the fetch to finish
    pub async fn fetch(
        &self,
        key: &str,
        fetch: &FetchFn<V>,
        ttl: Option<Duration>,
    ) -> Outcome<Fetched<V>> {
        match self.lookup(key, fetch, ttl) {
            Lookup::Fresh(value) => Ok(Fetched {
                value,
                from_cache: true,
            }),
            Lookup::Pending(pending) => self
                .settle(key, pending.completion)
                .await
                .map(|value| Fetched {
                    value,
                    from_cache: false,
                }),
        }
    }

    /// Force a new fetch for `key` with its last registered fetch function.
    ///
    /// The new generation supersedes any fetch already running. Unknown keys
    /// are ignored.
    pub fn refresh(&self, key: &str) {
        let Some(mut entry) = self.inner.entries.get_mut(key) else {
            debug!(key, "Refresh requested for unknown key");
            return;
        };
        let Some(fetch) = entry.fetcher.clone() else {
            return;
        };
        Inner::start(&self.inner, key, &mut entry, fetch);
    }

    /// Force a new fetch for `key` with an explicit fetch function
    pub fn refresh_with(&self, key: &str, fetch: &FetchFn<V>, ttl: Option<Duration>) -> Pending<V> {
        let ttl = ttl.unwrap_or(self.inner.default_ttl);
        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(ttl));
        entry.fetcher = Some(Arc::clone(fetch));
        entry.ttl = ttl;
        let (generation, completion) = Inner::start(&self.inner, key, &mut entry, Arc::clone(fetch));
        Pending {
            stale: entry.data.clone(),
            generation,
            completion,
        }
    }

    /// Join the fetch currently running for `key`, if any
    pub fn in_flight(&self, key: &str) -> Option<Pending<V>> {
        let entry = self.inner.entries.get(key)?;
        let in_flight = entry.in_flight.as_ref()?;
        Some(Pending {
            stale: entry.data.clone(),
            generation: in_flight.generation,
            completion: in_flight.future.clone(),
        })
    }

    /// Remove the entry for `key`. Returns whether an entry existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.entries.remove(key).is_some();
        if removed {
            self.inner.stats.record_invalidations(1);
            debug!(key, "Invalidated cache entry");
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`, or all entries.
    /// Returns the number of entries removed.
    pub fn clear(&self, prefix: Option<&str>) -> usize {
        let removed = match prefix {
            Some(prefix) => {
                let mut removed = 0usize;
                self.inner.entries.retain(|key, _| {
                    let keep = !key.starts_with(prefix);
                    if !keep {
                        removed += 1;
                    }
                    keep
                });
                removed
            }
            None => {
                let removed = self.inner.entries.len();
                self.inner.entries.clear();
                removed
            }
        };
        if removed > 0 {
            self.inner.stats.record_invalidations(removed as u64);
            info!(prefix = prefix.unwrap_or(""), removed, "Cleared cached requests");
        }
        removed
    }

    /// Committed data for `key`, ignoring TTL
    pub fn peek(&self, key: &str) -> Option<V> {
        self.inner.entries.get(key).and_then(|entry| entry.data.clone())
    }

    /// Whether an entry exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Diagnostic snapshot of all entries, sorted by key
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let mut entries: Vec<EntrySnapshot> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot(self.inner.entries.len())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Subscribe to fetch notifications
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Running fetch for `key`, or the outcome its newest generation
    /// committed. `None` for unknown keys and keys that never completed.
    ///
    /// Without a running fetch the entry's generation is the one that
    /// committed, since only the newest generation may commit.
    pub fn current(&self, key: &str) -> Option<Current<V>> {
        let entry = self.inner.entries.get(key)?;
        if let Some(in_flight) = &entry.in_flight {
            return Some(Current::Running(Pending {
                stale: entry.data.clone(),
                generation: in_flight.generation,
                completion: in_flight.future.clone(),
            }));
        }
        let outcome = match (&entry.data, &entry.last_error) {
            (Some(data), _) => Ok(data.clone()),
            (None, Some(error)) => Err(Arc::clone(error)),
            (None, None) => return None,
        };
        Some(Current::Settled {
            generation: entry.generation,
            outcome,
        })
    }
}

impl<V> Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start a new generation for `entry`. Caller holds the entry guard.
    fn start(
        this: &Arc<Self>,
        key: &str,
        entry: &mut CacheEntry<V>,
        fetch: FetchFn<V>,
    ) -> (u64, SharedFetch<V>) {
        let generation = this.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        entry.generation = generation;
        this.stats.record_fetch();
        debug!(key, generation, "Starting fetch");

        let task_inner = Arc::clone(this);
        let task_key = key.to_string();
        let task = tokio::spawn(async move {
            let result = match AssertUnwindSafe(async { fetch().await }).catch_unwind().await {
                Ok(result) => result.map_err(Arc::new),
                Err(_) => Err(Arc::new(Error::Internal(format!(
                    "fetch for '{task_key}' panicked"
                )))),
            };
            let status = task_inner.complete(&task_key, generation, &result);
            Completion {
                generation,
                result,
                status,
            }
        });

        let join_inner = Arc::clone(this);
        let join_key = key.to_string();
        let future = async move {
            match task.await {
                Ok(completion) => completion,
                Err(e) => {
                    let result = Err(Arc::new(Error::Internal(format!("fetch task failed: {e}"))));
                    let status = join_inner.complete(&join_key, generation, &result);
                    Completion {
                        generation,
                        result,
                        status,
                    }
                }
            }
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            generation,
            future: future.clone(),
        });
        // No receivers is fine
        let _ = this.events.send(CacheEvent::FetchStarted {
            key: key.to_string(),
            generation,
        });
        (generation, future)
    }

    fn complete(&self, key: &str, generation: u64, result: &Outcome<V>) -> CompletionStatus {
        let Some(mut entry) = self.entries.get_mut(key) else {
            debug!(key, generation, "Entry removed while fetch was in flight; result not cached");
            return CompletionStatus::Detached;
        };

        if entry
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            entry.in_flight = None;
        }

        if entry.generation != generation {
            self.stats.record_superseded();
            debug!(
                key,
                generation,
                current = entry.generation,
                "Discarding superseded fetch result"
            );
            return CompletionStatus::Superseded;
        }

        match result {
            Ok(_) => debug!(key, generation, "Fetch committed"),
            Err(e) => {
                self.stats.record_failure();
                warn!(key, generation, error = %e, "Fetch failed");
            }
        }
        entry.commit(result);
        CompletionStatus::Committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fetch_fn;
    use std::sync::atomic::AtomicUsize;

    fn counting(value: u32, calls: &Arc<AtomicUsize>) -> FetchFn<u32> {
        let calls = Arc::clone(calls);
        fetch_fn(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn test_generations_are_store_wide() {
        let cache: RequestCache<u32> = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting(1, &calls);

        let Lookup::Pending(first) = cache.lookup("a", &fetch, None) else {
            panic!("expected a fetch");
        };
        let Lookup::Pending(second) = cache.lookup("b", &fetch, None) else {
            panic!("expected a fetch");
        };
        assert!(second.generation > first.generation);

        // Re-created entries never reuse an old generation
        cache.invalidate("a");
        let Lookup::Pending(third) = cache.lookup("a", &fetch, None) else {
            panic!("expected a fetch");
        };
        assert!(third.generation > second.generation);
    }

    #[tokio::test]
    async fn test_detached_completion_is_not_cached() {
        let cache: RequestCache<u32> = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting(5, &calls);

        let Lookup::Pending(pending) = cache.lookup("k", &fetch, None) else {
            panic!("expected a fetch");
        };
        cache.invalidate("k");

        let done = pending.completion.await;
        assert_eq!(done.status, CompletionStatus::Detached);
        assert_eq!(done.result.unwrap(), 5);
        assert!(!cache.contains("k"));
    }

    #[tokio::test]
    async fn test_panicking_fetch_surfaces_internal_error() {
        let cache: RequestCache<u32> = RequestCache::new();
        fn explode() -> crate::Result<u32> {
            panic!("fetch blew up")
        }
        let fetch: FetchFn<u32> = fetch_fn(|| async { explode() });

        let err = cache.fetch("k", &fetch, None).await.unwrap_err();
        assert!(matches!(*err, Error::Internal(_)));
        assert!(cache.in_flight("k").is_none());
    }

    #[tokio::test]
    async fn test_refresh_unknown_key_is_noop() {
        let cache: RequestCache<u32> = RequestCache::new();
        cache.refresh("missing");
        assert!(cache.is_empty());
        assert_eq!(cache.stats().fetches, 0);
    }

    #[tokio::test]
    async fn test_current_reports_running_then_settled() {
        let cache: RequestCache<u32> = RequestCache::new();
        assert!(cache.current("k").is_none());

        let gate = Arc::new(tokio::sync::Notify::new());
        let waiting = Arc::clone(&gate);
        let fetch: FetchFn<u32> = fetch_fn(move || {
            let gate = Arc::clone(&waiting);
            async move {
                gate.notified().await;
                Ok(9)
            }
        });
        let Lookup::Pending(pending) = cache.lookup("k", &fetch, None) else {
            panic!("expected a fetch");
        };
        let Some(Current::Running(running)) = cache.current("k") else {
            panic!("fetch should be running");
        };
        assert_eq!(running.generation, pending.generation);

        gate.notify_one();
        cache.settle("k", pending.completion).await.unwrap();
        let Some(Current::Settled { generation, outcome }) = cache.current("k") else {
            panic!("fetch should have settled");
        };
        assert_eq!(generation, running.generation);
        assert_eq!(outcome.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_fetch_started_event() {
        let cache: RequestCache<u32> = RequestCache::new();
        let mut events = cache.events();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting(1, &calls);

        cache.fetch("k", &fetch, None).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::FetchStarted {
                key: "k".to_string(),
                generation: 1
            }
        );
    }
}
