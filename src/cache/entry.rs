//! Cache entries, in-flight markers and fetch completions

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;

use crate::{Result, SharedError};

/// Zero-argument fetch function producing the value for one key.
///
/// Stored on the entry so `refresh` can re-run it without the caller.
pub type FetchFn<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Box an async closure into a [`FetchFn`].
///
/// ```
/// use forecast_cache::cache::fetch_fn;
/// use serde_json::{Value, json};
///
/// let fetch = fetch_fn(|| async { Ok::<Value, forecast_cache::Error>(json!({"entities": []})) });
/// # let _ = fetch;
/// ```
pub fn fetch_fn<V, F, Fut>(f: F) -> FetchFn<V>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Result of a fetch as seen by everyone awaiting it
pub type Outcome<V> = std::result::Result<V, SharedError>;

/// What the store did with a completed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The result was written to the entry
    Committed,
    /// A newer fetch for the key started first; the result was discarded
    Superseded,
    /// The entry was removed while the fetch ran; nothing was written
    Detached,
}

/// A finished fetch, shared between all joined callers
#[derive(Debug, Clone)]
pub struct Completion<V> {
    /// Generation the fetch was started with
    pub generation: u64,
    /// Fetched value or failure
    pub result: Outcome<V>,
    /// How the store handled the result
    pub status: CompletionStatus,
}

/// Shared handle to an in-flight fetch
pub type SharedFetch<V> = Shared<BoxFuture<'static, Completion<V>>>;

pub(crate) struct InFlight<V> {
    pub(crate) generation: u64,
    pub(crate) future: SharedFetch<V>,
}

pub(crate) struct CacheEntry<V> {
    pub(crate) data: Option<V>,
    pub(crate) fetched_at: Option<Instant>,
    pub(crate) fetched_at_utc: Option<DateTime<Utc>>,
    pub(crate) ttl: Duration,
    pub(crate) in_flight: Option<InFlight<V>>,
    pub(crate) generation: u64,
    pub(crate) fetcher: Option<FetchFn<V>>,
    pub(crate) last_error: Option<SharedError>,
}

impl<V: Clone> CacheEntry<V> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            data: None,
            fetched_at: None,
            fetched_at_utc: None,
            ttl,
            in_flight: None,
            generation: 0,
            fetcher: None,
            last_error: None,
        }
    }

    /// Data younger than `ttl`, if any
    pub(crate) fn fresh_data(&self, ttl: Duration) -> Option<V> {
        match (&self.data, self.fetched_at) {
            (Some(data), Some(at)) if at.elapsed() < ttl => Some(data.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.fetched_at.is_none_or(|at| at.elapsed() >= self.ttl)
    }

    pub(crate) fn commit(&mut self, result: &Outcome<V>) {
        match result {
            Ok(value) => {
                self.data = Some(value.clone());
                self.fetched_at = Some(Instant::now());
                self.fetched_at_utc = Some(Utc::now());
                self.last_error = None;
            }
            Err(e) => {
                self.data = None;
                self.fetched_at = None;
                self.fetched_at_utc = None;
                self.last_error = Some(Arc::clone(e));
            }
        }
    }

    pub(crate) fn snapshot(&self, key: &str) -> EntrySnapshot {
        EntrySnapshot {
            key: key.to_string(),
            has_data: self.data.is_some(),
            fetched_at: self.fetched_at_utc,
            ttl_ms: u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
            expired: self.is_expired(),
            generation: self.generation,
            in_flight: self.in_flight.is_some(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Diagnostic view of one cache entry
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    /// Cache key
    pub key: String,
    /// Whether a committed value is present
    pub has_data: bool,
    /// Wall-clock time of the last successful fetch
    pub fetched_at: Option<DateTime<Utc>>,
    /// TTL recorded for the entry
    pub ttl_ms: u64,
    /// Whether the recorded TTL has elapsed
    pub expired: bool,
    /// Generation of the latest fetch started for the key
    pub generation: u64,
    /// Whether a fetch is currently running
    pub in_flight: bool,
    /// Last failure, if the latest committed fetch failed
    pub last_error: Option<String>,
}
