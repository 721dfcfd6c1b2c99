//! Polling policies.
use std::{fmt, sync::Arc, time::Duration};

use crate::{Error, Result};

/// Outcome of a refresh attempt.
#[derive(Debug, Clone)]
pub struct RefreshResult {
    error: Option<Error>,
}

impl RefreshResult {
    pub(crate) fn success() -> RefreshResult {
        RefreshResult { error: None }
    }

    pub(crate) fn failure(error: Error) -> RefreshResult {
        RefreshResult { error: Some(error) }
    }

    /// `true` if the refresh succeeded (including "not modified").
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Why the refresh failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

type RefreshCallback = Arc<dyn Fn(&RefreshResult) + Send + Sync>;

/// When and how the client fetches the configuration.
#[derive(Clone)]
pub enum PollingMode {
    /// Fetch on start, then every `interval` in the background.
    AutoPoll {
        /// Time between fetches.
        interval: Duration,
        /// How long value requests wait for the first fetch before serving cached values.
        max_init_wait: Duration,
        /// Invoked after every background refresh attempt.
        on_refresh: Option<RefreshCallback>,
    },
    /// Fetch on demand, when the cached configuration is older than `cache_ttl`.
    LazyLoad {
        /// Maximum age of the cached configuration.
        cache_ttl: Duration,
    },
    /// Fetch only when [`Client::force_refresh()`](crate::Client::force_refresh) is called.
    Manual,
}

impl PollingMode {
    /// Default auto poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
    /// Default maximum wait for the first fetch.
    pub const DEFAULT_MAX_INIT_WAIT: Duration = Duration::from_secs(5);
    /// Default lazy load TTL.
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
    /// Intervals and TTLs below this are rejected.
    pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

    /// Auto poll with the given interval and the default maximum init wait.
    pub fn auto_poll(interval: Duration) -> PollingMode {
        PollingMode::AutoPoll {
            interval,
            max_init_wait: PollingMode::DEFAULT_MAX_INIT_WAIT,
            on_refresh: None,
        }
    }

    /// Lazy load with the given cache TTL.
    pub fn lazy_load(cache_ttl: Duration) -> PollingMode {
        PollingMode::LazyLoad { cache_ttl }
    }

    /// Manual polling.
    pub fn manual() -> PollingMode {
        PollingMode::Manual
    }

    /// Update the maximum init wait. No effect on other modes.
    pub fn with_max_init_wait(mut self, wait: Duration) -> PollingMode {
        if let PollingMode::AutoPoll { max_init_wait, .. } = &mut self {
            *max_init_wait = wait;
        }
        self
    }

    /// Set the callback invoked after every background refresh. No effect on other modes.
    pub fn with_on_refresh(
        mut self,
        callback: impl Fn(&RefreshResult) + Send + Sync + 'static,
    ) -> PollingMode {
        if let PollingMode::AutoPoll { on_refresh, .. } = &mut self {
            *on_refresh = Some(Arc::new(callback));
        }
        self
    }

    /// Short identifier sent in the user agent header.
    pub(crate) fn identifier(&self) -> &'static str {
        match self {
            PollingMode::AutoPoll { .. } => "a",
            PollingMode::LazyLoad { .. } => "l",
            PollingMode::Manual => "m",
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            PollingMode::AutoPoll { interval, .. } if *interval < PollingMode::MIN_INTERVAL => {
                Err(Error::InvalidConfig(format!(
                    "auto poll interval must be at least 1 second, got {interval:?}"
                )))
            }
            PollingMode::LazyLoad { cache_ttl } if *cache_ttl < PollingMode::MIN_INTERVAL => {
                Err(Error::InvalidConfig(format!(
                    "lazy load cache TTL must be at least 1 second, got {cache_ttl:?}"
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Default for PollingMode {
    fn default() -> PollingMode {
        PollingMode::auto_poll(PollingMode::DEFAULT_POLL_INTERVAL)
    }
}

impl fmt::Debug for PollingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollingMode::AutoPoll {
                interval,
                max_init_wait,
                on_refresh,
            } => f
                .debug_struct("AutoPoll")
                .field("interval", interval)
                .field("max_init_wait", max_init_wait)
                .field("on_refresh", &on_refresh.is_some())
                .finish(),
            PollingMode::LazyLoad { cache_ttl } => f
                .debug_struct("LazyLoad")
                .field("cache_ttl", cache_ttl)
                .finish(),
            PollingMode::Manual => f.write_str("Manual"),
        }
    }
}
