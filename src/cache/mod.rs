//! Cached request engine
//!
//! A keyed cache of asynchronous fetch results with:
//!
//! - TTL expiry, checked lazily on access
//! - single-flight fetches: concurrent requests for one key share one fetch
//! - generation guards: only the most recently *started* fetch for a key
//!   may commit its result
//! - manual refresh, invalidation and prefix clearing
//!
//! The process-wide store is available through [`global`]; tests and
//! embedders can create isolated [`RequestCache`] instances.
//!
//! ```
//! use forecast_cache::cache::{RequestCache, fetch_fn};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let cache = RequestCache::new();
//! let fetch = fetch_fn(|| async { Ok(json!({"methods": ["analog"]})) });
//!
//! let first = cache.fetch("ws1|2024-01-01", &fetch, None).await.unwrap();
//! let second = cache.fetch("ws1|2024-01-01", &fetch, None).await.unwrap();
//! assert!(!first.from_cache);
//! assert!(second.from_cache);
//! # });
//! ```

mod entry;
mod stats;
mod store;

use std::sync::LazyLock;
use std::time::Duration;

pub use entry::{
    Completion, CompletionStatus, EntrySnapshot, FetchFn, Outcome, SharedFetch, fetch_fn,
};
pub use stats::CacheStatsSnapshot;
pub use store::{CacheEvent, Current, Fetched, Lookup, Pending, RequestCache};

/// TTL applied when a request does not name one (5 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

static GLOBAL: LazyLock<RequestCache> = LazyLock::new(RequestCache::new);

/// The process-wide request cache
pub fn global() -> &'static RequestCache {
    &GLOBAL
}

/// Remove `key` from the process-wide cache. `None` and unknown keys are ignored.
pub fn invalidate_cached_key(key: Option<&str>) {
    if let Some(key) = key {
        GLOBAL.invalidate(key);
    }
}

/// Remove every process-wide entry starting with `prefix`, or all of them
pub fn clear_cached_requests(prefix: Option<&str>) {
    GLOBAL.clear(prefix);
}
