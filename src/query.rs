//! Per-consumer subscriptions to the request cache
//!
//! A [`Query`] is one data binding (one panel, one chart). It projects the
//! shared cache into `data / loading / error / from_cache` and guards that
//! projection with a request counter: every `request` or `refresh` bumps the
//! counter, and a completion is applied only if the counter it captured is
//! still current. A dropped query never receives late completions.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::cache::{CacheEvent, Current, FetchFn, Lookup, Outcome, Pending, RequestCache};
use crate::{Error, SharedError};

/// Options of a query
#[derive(Clone)]
pub struct QueryOptions<V> {
    /// When false the query never fetches (same as a `None` key)
    pub enabled: bool,
    /// Value shown before the first successful fetch and after a failure
    pub initial_data: Option<V>,
    /// TTL for this query's requests; the store default when `None`
    pub ttl: Option<Duration>,
}

impl<V> Default for QueryOptions<V> {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_data: None,
            ttl: None,
        }
    }
}

impl<V> QueryOptions<V> {
    /// Enable or disable fetching
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the initial/fallback value
    #[must_use]
    pub fn initial_data(mut self, data: V) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Set the TTL
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// What a consumer renders from
#[derive(Debug, Clone)]
pub struct QueryState<V> {
    /// Current value (fresh, stale while refreshing, or the initial data)
    pub data: Option<V>,
    /// A fetch is running for the bound key
    pub loading: bool,
    /// Failure of the latest fetch
    pub error: Option<SharedError>,
    /// The value came from a fresh cache entry without a fetch
    pub from_cache: bool,
}

/// Tagged form of [`QueryState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Fetching with nothing to show yet
    Loading,
    /// Fetching while showing a previous value
    Refreshing,
    /// Settled with data
    Fresh,
    /// Settled without data (disabled, no key, or nothing fetched)
    Empty,
    /// The latest fetch failed
    Error,
}

/// Panel rendering decision, in priority order loading, error, empty
#[derive(Debug)]
pub enum PanelView<'a, V> {
    /// Show a loading message
    Loading,
    /// Show an error message
    Error(&'a Error),
    /// Show an empty message
    Empty,
    /// Render the data
    Ready(&'a V),
}

impl<V: PartialEq> PartialEq for PanelView<'_, V> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Loading, Self::Loading) | (Self::Empty, Self::Empty) => true,
            (Self::Error(a), Self::Error(b)) => std::ptr::eq(*a, *b),
            (Self::Ready(a), Self::Ready(b)) => a == b,
            _ => false,
        }
    }
}

impl<V> QueryState<V> {
    fn idle(data: Option<V>) -> Self {
        Self {
            data,
            loading: false,
            error: None,
            from_cache: false,
        }
    }

    /// Tagged status
    pub fn status(&self) -> Status {
        match (self.loading, &self.error, &self.data) {
            (true, _, Some(_)) => Status::Refreshing,
            (true, _, None) => Status::Loading,
            (false, Some(_), _) => Status::Error,
            (false, None, Some(_)) => Status::Fresh,
            (false, None, None) => Status::Empty,
        }
    }

    /// Panel view where only a missing value counts as empty
    pub fn view(&self) -> PanelView<'_, V> {
        self.view_with(|_| false)
    }

    /// Panel view with a custom emptiness test (e.g. an empty entity list)
    pub fn view_with(&self, is_empty: impl Fn(&V) -> bool) -> PanelView<'_, V> {
        if self.loading {
            return PanelView::Loading;
        }
        if let Some(error) = &self.error {
            return PanelView::Error(&**error);
        }
        match &self.data {
            Some(data) if !is_empty(data) => PanelView::Ready(data),
            _ => PanelView::Empty,
        }
    }
}

struct Binding<V> {
    key: String,
    fetch: FetchFn<V>,
}

/// Request-guard state. Every decision to publish is taken under its lock.
struct Guard<V> {
    binding: Option<Binding<V>>,
    request_id: u64,
    /// Newest fetch generation this query has waited on or applied
    seen_generation: u64,
}

struct QueryShared<V> {
    cache: RequestCache<V>,
    options: QueryOptions<V>,
    guard: Mutex<Guard<V>>,
    /// Bound key, readable by the listener without the guard
    bound_key: watch::Sender<Option<String>>,
    state: watch::Sender<QueryState<V>>,
    _listener: DropGuard,
}

/// One consumer's binding to the request cache
pub struct Query<V = Value> {
    shared: Arc<QueryShared<V>>,
}

impl<V> Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a query against `cache`. Must be called inside a tokio runtime.
    pub fn new(cache: RequestCache<V>, options: QueryOptions<V>) -> Self {
        let token = CancellationToken::new();
        let events = cache.events();
        let (state, _) = watch::channel(QueryState::idle(options.initial_data.clone()));
        let (bound_key, bound_rx) = watch::channel(None);
        let shared = Arc::new(QueryShared {
            cache,
            options,
            guard: Mutex::new(Guard {
                binding: None,
                request_id: 0,
                seen_generation: 0,
            }),
            bound_key,
            state,
            _listener: token.clone().drop_guard(),
        });
        tokio::spawn(listen(Arc::downgrade(&shared), events, bound_rx, token));
        Self { shared }
    }

    /// Bind to `key` and return the state to render right now.
    ///
    /// Abandons interest in any earlier request of this query. A `None` key
    /// or a disabled query never fetches.
    pub fn request(&self, key: Option<&str>, fetch: FetchFn<V>) -> QueryState<V> {
        let shared = &self.shared;
        let mut guard = shared.guard.lock();
        guard.request_id += 1;

        let key = match key {
            Some(key) if shared.options.enabled => key,
            _ => {
                shared.bind(&mut guard, None);
                return shared.publish(QueryState::idle(shared.options.initial_data.clone()));
            }
        };
        shared.bind(
            &mut guard,
            Some(Binding {
                key: key.to_string(),
                fetch: Arc::clone(&fetch),
            }),
        );

        match shared.cache.lookup(key, &fetch, shared.options.ttl) {
            Lookup::Fresh(data) => shared.publish(QueryState {
                data: Some(data),
                loading: false,
                error: None,
                from_cache: true,
            }),
            Lookup::Pending(pending) => QueryShared::wait(shared, &mut guard, key, pending),
        }
    }

    /// Force a re-fetch of the bound key, ignoring TTL
    pub fn refresh(&self) {
        let shared = &self.shared;
        let mut guard = shared.guard.lock();
        let Some((key, fetch)) = guard
            .binding
            .as_ref()
            .map(|b| (b.key.clone(), Arc::clone(&b.fetch)))
        else {
            return;
        };
        guard.request_id += 1;
        let pending = shared.cache.refresh_with(&key, &fetch, shared.options.ttl);
        QueryShared::wait(shared, &mut guard, &key, pending);
    }

    /// Current state
    pub fn state(&self) -> QueryState<V> {
        self.shared.state.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<QueryState<V>> {
        self.shared.state.subscribe()
    }

    /// Wait until no fetch is running and return the state
    pub async fn settled(&self) -> QueryState<V> {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| !state.loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Key currently bound, if any
    pub fn key(&self) -> Option<String> {
        self.shared.guard.lock().binding.as_ref().map(|b| b.key.clone())
    }
}

impl<V> QueryShared<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn bind(&self, guard: &mut Guard<V>, binding: Option<Binding<V>>) {
        let key = binding.as_ref().map(|b| b.key.clone());
        guard.binding = binding;
        self.bound_key.send_if_modified(|bound| {
            if *bound == key {
                return false;
            }
            *bound = key;
            true
        });
    }

    fn publish(&self, state: QueryState<V>) -> QueryState<V> {
        self.state.send_replace(state.clone());
        state
    }

    fn settled_state(&self, outcome: Outcome<V>) -> QueryState<V> {
        match outcome {
            Ok(data) => QueryState {
                data: Some(data),
                loading: false,
                error: None,
                from_cache: false,
            },
            Err(error) => QueryState {
                data: self.options.initial_data.clone(),
                loading: false,
                error: Some(error),
                from_cache: false,
            },
        }
    }

    /// Show the pending state and apply the completion when it lands.
    /// Caller holds the guard and has already bumped the request id.
    fn wait(
        this: &Arc<Self>,
        guard: &mut Guard<V>,
        key: &str,
        pending: Pending<V>,
    ) -> QueryState<V> {
        let request_id = guard.request_id;
        guard.seen_generation = guard.seen_generation.max(pending.generation);
        let state = this.publish(QueryState {
            data: pending.stale.or_else(|| this.options.initial_data.clone()),
            loading: true,
            error: None,
            from_cache: false,
        });

        let weak = Arc::downgrade(this);
        let cache = this.cache.clone();
        let key = key.to_string();
        let completion = pending.completion;
        tokio::spawn(async move {
            let outcome = cache.settle(&key, completion).await;
            let Some(shared) = weak.upgrade() else {
                trace!(key = %key, "Query disposed before fetch completed");
                return;
            };
            let guard = shared.guard.lock();
            if guard.request_id != request_id {
                debug!(key = %key, request_id, "Ignoring result of abandoned request");
                return;
            }
            shared.publish(shared.settled_state(outcome));
        });

        state
    }

    /// A fetch for our key was started elsewhere; follow it unless we
    /// already waited on it or on something newer
    fn follow(this: &Arc<Self>, key: &str, generation: u64) {
        let mut guard = this.guard.lock();
        let bound = guard
            .binding
            .as_ref()
            .is_some_and(|binding| binding.key == key);
        if !bound || guard.seen_generation >= generation {
            return;
        }

        match this.cache.current(key) {
            Some(Current::Running(pending)) if pending.generation > guard.seen_generation => {
                trace!(key, generation = pending.generation, "Following external fetch");
                guard.request_id += 1;
                let Pending {
                    stale,
                    generation,
                    completion,
                } = pending;
                let stale = stale.or_else(|| this.state.borrow().data.clone());
                Self::wait(
                    this,
                    &mut guard,
                    key,
                    Pending {
                        stale,
                        generation,
                        completion,
                    },
                );
            }
            Some(Current::Settled {
                generation,
                outcome,
            }) if generation > guard.seen_generation => {
                // Finished before we heard of it
                trace!(key, generation, "Applying external fetch result");
                guard.request_id += 1;
                guard.seen_generation = generation;
                this.publish(this.settled_state(outcome));
            }
            _ => {}
        }
    }
}

async fn listen<V>(
    query: Weak<QueryShared<V>>,
    mut events: broadcast::Receiver<CacheEvent>,
    bound_key: watch::Receiver<Option<String>>,
    token: CancellationToken,
) where
    V: Clone + Send + Sync + 'static,
{
    loop {
        let event = tokio::select! {
            () = token.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(CacheEvent::FetchStarted { key, generation }) => {
                let interested = bound_key.borrow().as_deref() == Some(key.as_str());
                if !interested {
                    continue;
                }
                let Some(shared) = query.upgrade() else {
                    return;
                };
                QueryShared::follow(&shared, &key, generation);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Query listener lagged behind cache events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
