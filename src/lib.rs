//! Forecast Cache Library
//!
//! Cached request engine for forecast-data clients.
//!
//! # Features
//!
//! - **Single-flight**: concurrent requests for one key share one fetch
//! - **TTL expiry**: entries go stale lazily, on the next access
//! - **Stale-response guards**: per-key generations and per-query request
//!   counters discard results of superseded fetches
//! - **Invalidation**: by key, by key prefix, or everything
//! - **Forecast API client**: JSON GET with retries on 5xx

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod query;
pub mod retry;

pub use cache::{
    RequestCache, clear_cached_requests, fetch_fn, global, invalidate_cached_key,
};
pub use error::{Error, Result, SharedError};
pub use query::{PanelView, Query, QueryOptions, QueryState, Status};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
