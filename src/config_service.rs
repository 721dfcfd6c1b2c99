//! Scheduling of configuration fetches: polling policies, single-flight refreshes, offline mode
//! and synchronization with the external cache.
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::{runtime::Handle, sync::watch, time::MissedTickBehavior};

use crate::{
    cache::ConfigCache,
    configuration::Configuration,
    configuration_fetcher::{ConfigurationFetcher, FetchResult},
    configuration_store::ConfigurationStore,
    hooks::{ClientCacheState, Hooks},
    logger::ClientLogger,
    polling_mode::{PollingMode, RefreshResult},
    Error,
};

type RefreshFuture = Shared<BoxFuture<'static, RefreshResult>>;

/// Releases the single-flight slot when the fetch task finishes, panics or is cancelled.
struct ClearInFlight<'a>(&'a Inner);

impl Drop for ClearInFlight<'_> {
    fn drop(&mut self) {
        self.0.lock_state().in_flight = None;
    }
}

/// Run a user-supplied cache operation, turning a panic into an error.
fn guard_cache<T>(op: impl FnOnce() -> crate::Result<T>) -> crate::Result<T> {
    panic::catch_unwind(AssertUnwindSafe(op)).unwrap_or(Err(Error::CachePanicked))
}

pub(crate) struct ConfigServiceConfig {
    pub mode: PollingMode,
    pub cache: Arc<dyn ConfigCache>,
    pub cache_key: String,
    pub offline: bool,
    /// Local overrides are present; affects the reported cache state.
    pub has_overrides: bool,
}

/// Keeps the [`ConfigurationStore`] up to date according to the polling policy.
///
/// Cheap to clone: all clones share the same state.
#[derive(Clone)]
pub(crate) struct ConfigService {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<ConfigurationStore>,
    fetcher: ConfigurationFetcher,
    cache: Arc<dyn ConfigCache>,
    cache_key: String,
    mode: PollingMode,
    has_overrides: bool,
    hooks: Arc<Hooks>,
    logger: Arc<ClientLogger>,
    runtime: Handle,
    offline: AtomicBool,
    closed: AtomicBool,
    /// Flips to `true` once; value requests in auto poll mode wait for it.
    initialized: watch::Sender<bool>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// The fetch currently in flight. Concurrent refresh requests attach to it.
    in_flight: Option<RefreshFuture>,
    /// Last time the server (or a shared cache) confirmed the current document.
    validated_at: Option<DateTime<Utc>>,
    /// Last cache entry read or written, to skip re-parsing unchanged entries.
    last_cache_entry: Option<String>,
    /// Dropping the sender stops the poll task.
    poll_stop: Option<watch::Sender<()>>,
}

impl ConfigService {
    pub fn start(
        config: ConfigServiceConfig,
        store: Arc<ConfigurationStore>,
        fetcher: ConfigurationFetcher,
        hooks: Arc<Hooks>,
        logger: Arc<ClientLogger>,
        runtime: Handle,
    ) -> ConfigService {
        let (initialized, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            store,
            fetcher,
            cache: config.cache,
            cache_key: config.cache_key,
            mode: config.mode,
            has_overrides: config.has_overrides,
            hooks,
            logger,
            runtime,
            offline: AtomicBool::new(config.offline),
            closed: AtomicBool::new(false),
            initialized,
            state: Mutex::new(State::default()),
        });

        match &inner.mode {
            PollingMode::AutoPoll { max_init_wait, .. } if !config.offline => {
                inner.start_poll();
                let waiter = inner.clone();
                let max_init_wait = *max_init_wait;
                inner.runtime.spawn(async move {
                    tokio::time::sleep(max_init_wait).await;
                    waiter.set_initialized();
                });
            }
            _ => {
                inner.sync_from_cache();
                inner.set_initialized();
            }
        }

        ConfigService { inner }
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Returns `true` if a value request can be answered from the store right now, without
    /// waiting for a fetch.
    pub fn is_ready_now(&self) -> bool {
        let inner = &self.inner;
        inner.sync_from_cache();
        if inner.is_closed() || inner.is_offline() {
            return true;
        }
        match &inner.mode {
            PollingMode::AutoPoll { .. } => inner.is_initialized(),
            PollingMode::LazyLoad { cache_ttl } => inner.is_fresh(*cache_ttl),
            PollingMode::Manual => true,
        }
    }

    /// Bring the store up to date for a value request, waiting or fetching per policy.
    pub async fn prepare(&self) {
        let inner = &self.inner;
        match &inner.mode {
            PollingMode::AutoPoll { max_init_wait, .. } => {
                inner.wait_for_init(*max_init_wait).await;
                inner.clone().fetch_if_older(None, true).await;
            }
            PollingMode::LazyLoad { cache_ttl } => {
                inner.clone().fetch_if_older(Some(*cache_ttl), false).await;
            }
            PollingMode::Manual => {
                inner.clone().fetch_if_older(None, true).await;
            }
        }
    }

    /// Fetch now, regardless of the policy. Attaches to a fetch already in flight.
    pub fn refresh(&self) -> BoxFuture<'static, RefreshResult> {
        if self.inner.is_closed() {
            return futures::future::ready(RefreshResult::failure(Error::ClientClosed)).boxed();
        }
        if self.inner.is_offline() {
            self.inner.logger.warn(
                3200,
                "client is in offline mode, it cannot initiate HTTP calls",
            );
            return futures::future::ready(RefreshResult::failure(Error::Offline)).boxed();
        }
        self.inner.sync_from_cache();
        self.inner.refresh().boxed()
    }

    pub fn set_online(&self) {
        let inner = &self.inner;
        if inner.is_closed() {
            inner
                .logger
                .warn(3201, "client is closed; set_online() has no effect");
            return;
        }
        if !inner.offline.swap(false, Ordering::SeqCst) {
            return;
        }
        if let PollingMode::AutoPoll { .. } = inner.mode {
            inner.start_poll();
        }
        inner.logger.info(5200, "switched to ONLINE mode");
    }

    pub fn set_offline(&self) {
        let inner = &self.inner;
        if inner.offline.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.stop_poll();
        inner.logger.info(5200, "switched to OFFLINE mode");
    }

    pub fn is_offline(&self) -> bool {
        self.inner.is_offline()
    }

    /// Stop polling and refuse further fetches. A fetch in flight completes.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.stop_poll();
        inner.fetcher.close();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Time the current document was last known to be up to date.
    fn freshness(&self) -> Option<DateTime<Utc>> {
        let fetched_at = self.store.get().map(|configuration| configuration.fetched_at);
        let validated_at = self.lock_state().validated_at;
        fetched_at.max(validated_at)
    }

    fn is_fresh(&self, max_age: Duration) -> bool {
        let Some(freshness) = self.freshness() else {
            return false;
        };
        let age = Utc::now().signed_duration_since(freshness);
        age.to_std().map_or(true, |age| age < max_age)
    }

    fn mark_validated(&self, at: DateTime<Utc>) {
        let mut state = self.lock_state();
        state.validated_at = state.validated_at.max(Some(at));
    }

    fn start_poll(self: &Arc<Self>) {
        let PollingMode::AutoPoll {
            interval,
            on_refresh,
            ..
        } = &self.mode
        else {
            return;
        };

        let (stop_sender, stop_receiver) = watch::channel(());
        {
            let mut state = self.lock_state();
            // Replacing the sender stops a previous poll task.
            state.poll_stop = Some(stop_sender);
        }

        let inner = self.clone();
        let interval = *interval;
        let on_refresh = on_refresh.clone();
        self.runtime.spawn(async move {
            inner.poll(interval, on_refresh, stop_receiver).await;
        });
    }

    fn stop_poll(&self) {
        let stop_sender = self.lock_state().poll_stop.take();
        drop(stop_sender);
    }

    async fn poll(
        self: Arc<Self>,
        interval: Duration,
        on_refresh: Option<Arc<dyn Fn(&RefreshResult) + Send + Sync>>,
        mut stop: watch::Receiver<()>,
    ) {
        log::debug!(target: "flagpole", interval:debug; "poll task started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Documents younger than 70% of the interval (e.g. written to a shared cache by another
        // client) are not fetched again.
        let max_age = interval.mul_f64(0.7);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {
                    log::debug!(target: "flagpole", "poll task received stop command");
                    return;
                }
            }

            if self.is_closed() || self.is_offline() {
                return;
            }

            let result = self.clone().fetch_if_older(Some(max_age), false).await;
            if let Some(on_refresh) = &on_refresh {
                let on_refresh = on_refresh.clone();
                let guarded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    on_refresh(&result)
                }));
                if guarded.is_err() {
                    log::error!(target: "flagpole", "on_refresh callback panicked");
                }
            }
        }
    }

    /// Fetch unless the document is younger than `max_age`.
    ///
    /// `max_age == None` never counts as fresh. With `prefer_cache`, an initialized service
    /// serves the cached document instead of fetching.
    async fn fetch_if_older(
        self: Arc<Self>,
        max_age: Option<Duration>,
        prefer_cache: bool,
    ) -> RefreshResult {
        self.sync_from_cache();

        if max_age.is_some_and(|max_age| self.is_fresh(max_age)) {
            self.set_initialized();
            return RefreshResult::success();
        }

        if self.is_closed() {
            return RefreshResult::failure(Error::ClientClosed);
        }
        if self.is_offline() {
            return RefreshResult::failure(Error::Offline);
        }
        if prefer_cache && self.is_initialized() {
            return RefreshResult::success();
        }

        self.refresh().await
    }

    /// Start a fetch or attach to the one in flight.
    fn refresh(self: &Arc<Self>) -> RefreshFuture {
        let mut state = self.lock_state();
        if let Some(in_flight) = &state.in_flight {
            return in_flight.clone();
        }

        let inner = self.clone();
        let handle = self.runtime.spawn(async move {
            let result = {
                let _in_flight = ClearInFlight(&inner);
                inner.clone().fetch_and_store().await
            };
            inner.set_initialized();
            result
        });
        let inner = self.clone();
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    inner.set_initialized();
                    RefreshResult::failure(Error::FetchTaskPanicked)
                }
                Err(_) => RefreshResult::failure(Error::ClientClosed),
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(future.clone());
        future
    }

    async fn fetch_and_store(self: Arc<Self>) -> RefreshResult {
        let previous = self.store.get();
        let etag = previous
            .as_ref()
            .and_then(|configuration| configuration.etag.clone());

        match self.fetcher.fetch(etag.as_deref()).await {
            FetchResult::Fetched(configuration) => {
                let configuration = Arc::new(configuration);
                self.mark_validated(configuration.fetched_at);
                self.write_cache(configuration.to_cache_entry());
                self.store.set(configuration);
                RefreshResult::success()
            }
            FetchResult::NotModified => {
                let now = Utc::now();
                self.mark_validated(now);
                if let Some(previous) = &previous {
                    self.write_cache(previous.cache_entry_at(now));
                }
                RefreshResult::success()
            }
            FetchResult::Failed(err) => {
                if matches!(err, Error::InvalidSdkKey(_)) {
                    // Retrying with the same key is pointless until the TTL expires.
                    self.mark_validated(Utc::now());
                }
                RefreshResult::failure(err)
            }
        }
    }

    /// Adopt the external cache entry when it differs from the current document.
    fn sync_from_cache(&self) {
        let entry = match guard_cache(|| self.cache.read(&self.cache_key)) {
            Ok(Some(entry)) if !entry.is_empty() => entry,
            Ok(_) => return,
            Err(err) => {
                self.logger
                    .error(2200, "error occurred while reading the cache", Some(&err));
                return;
            }
        };

        {
            let mut state = self.lock_state();
            if state.last_cache_entry.as_deref() == Some(entry.as_str()) {
                return;
            }
            state.last_cache_entry = Some(entry.clone());
        }

        let configuration = match Configuration::from_cache_entry(&entry) {
            Ok(configuration) => configuration,
            Err(err) => {
                self.logger
                    .error(2200, "error occurred while reading the cache", Some(&err));
                return;
            }
        };

        self.mark_validated(configuration.fetched_at);
        let current = self.store.get();
        let differs = current.map_or(true, |current| !current.same_content(&configuration));
        if differs {
            self.store.set(Arc::new(configuration));
        }
    }

    fn write_cache(&self, entry: String) {
        if let Err(err) = guard_cache(|| self.cache.write(&self.cache_key, &entry)) {
            self.logger
                .error(2201, "error occurred while writing the cache", Some(&err));
        }
        self.lock_state().last_cache_entry = Some(entry);
    }

    async fn wait_for_init(&self, max_init_wait: Duration) {
        let mut initialized = self.initialized.subscribe();
        let waited = tokio::time::timeout(max_init_wait, initialized.wait_for(|ready| *ready)).await;
        if waited.is_err() {
            self.logger.warn(
                4200,
                format_args!(
                    "max_init_wait of {}ms expired; serving the cached configuration",
                    max_init_wait.as_millis()
                ),
            );
            self.set_initialized();
        }
    }

    /// Mark the service initialized. Fires `on_client_ready` the first time.
    fn set_initialized(&self) {
        let first = self.initialized.send_if_modified(|initialized| {
            let first = !*initialized;
            *initialized = true;
            first
        });
        if first {
            self.hooks.invoke_on_client_ready(self.cache_state());
        }
    }

    fn cache_state(&self) -> ClientCacheState {
        if self.store.get().is_none() {
            return if self.has_overrides {
                ClientCacheState::HasLocalOverrideFlagDataOnly
            } else {
                ClientCacheState::NoFlagData
            };
        }
        let up_to_date = match &self.mode {
            PollingMode::AutoPoll { interval, .. } => self.is_fresh(*interval),
            PollingMode::LazyLoad { cache_ttl } => self.is_fresh(*cache_ttl),
            PollingMode::Manual => false,
        };
        if up_to_date {
            ClientCacheState::HasUpToDateFlagData
        } else {
            ClientCacheState::HasCachedFlagDataOnly
        }
    }
}
