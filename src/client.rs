//! Forecast API client
//!
//! Produces the fetch functions the request cache runs: a GET against the
//! forecast API, JSON decoding, and retries on 5xx/transport failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{FetchFn, fetch_fn};
use crate::config::{ApiConfig, RetryConfig};
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// A source of JSON documents addressed by path and query parameters
#[async_trait]
pub trait JsonSource: Send + Sync {
    /// GET `path` with `query` and decode the JSON body
    async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value>;
}

/// HTTP client for the forecast API
pub struct ForecastClient {
    http: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl ForecastClient {
    /// Create a client from configuration
    pub fn new(api: &ApiConfig, retry: &RetryConfig) -> Result<Self> {
        let mut base = api.base_url.clone();
        // Url::join drops the last path segment unless the base ends with '/'
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| Error::Config(format!("invalid api.base_url '{base}': {e}")))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        for (name, value) in &api.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name '{name}': {e}")))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let http = Client::builder()
            .timeout(api.timeout)
            .default_headers(headers)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            http,
            base_url,
            retry: RetryPolicy::new(retry),
        })
    }

    /// Base URL requests are resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` against the base URL and append `query`.
    ///
    /// Parameters keep their order; a name may repeat (`?method=a&method=b`).
    pub fn endpoint(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid path '{path}': {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn get_once(&self, url: &Url) -> Result<Value> {
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Server {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl JsonSource for ForecastClient {
    async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let url = self.endpoint(path, query)?;
        let started = Instant::now();

        let result = with_retry(&self.retry, path, || self.get_once(&url)).await;

        match &result {
            Ok(_) => debug!(
                url = %url,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "GET succeeded"
            ),
            Err(e) => warn!(url = %url, error = %e, "GET failed"),
        }
        result
    }
}

/// Wrap a GET against `source` into a fetch function for the request cache
pub fn source_fetcher(
    source: Arc<dyn JsonSource>,
    path: impl Into<String>,
    query: Vec<(String, String)>,
) -> FetchFn<Value> {
    let path = Arc::new(path.into());
    let query = Arc::new(query);
    fetch_fn(move || {
        let source = Arc::clone(&source);
        let path = Arc::clone(&path);
        let query = Arc::clone(&query);
        async move { source.get_json(&path, &query).await }
    })
}
