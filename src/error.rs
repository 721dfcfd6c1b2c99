use std::sync::Arc;

use crate::models::SettingType;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the flag client.
///
/// None of these surface from value retrieval: `Client::get_value()` and friends always resolve
/// to a usable value and report the error through logs, the `on_error` hook and
/// [`EvaluationDetails::error`](crate::EvaluationDetails).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Requested flag is not present in the configuration.
    #[error("flag {key:?} not found; available keys: {available:?}")]
    KeyNotFound {
        /// The requested key.
        key: String,
        /// Keys present in the current configuration.
        available: Vec<String>,
    },

    /// Requested value type does not match the declared type of the setting.
    #[error("type mismatch for flag {key:?}: requested {requested:?}, setting is {actual:?}")]
    TypeMismatch {
        /// The requested key.
        key: String,
        /// Type the caller asked for.
        requested: SettingType,
        /// Type declared by the setting.
        actual: SettingType,
    },

    /// The setting exists but could not be parsed (e.g., unknown comparator or value type).
    #[error("error parsing configuration for flag {0:?}")]
    ConfigurationParseError(String),

    /// No configuration has been fetched or loaded from cache yet.
    #[error("config JSON is not present")]
    ConfigNotAvailable,

    /// The server returned a body that is not a valid configuration document.
    #[error("malformed configuration document")]
    MalformedDocument(#[source] Arc<serde_json::Error>),

    /// The server responded with 403 or 404. The SDK key is most likely wrong.
    #[error("invalid SDK key: configuration fetch returned {0}")]
    InvalidSdkKey(u16),

    /// The server responded with an unexpected status code.
    #[error("unexpected HTTP response: {0}")]
    HttpStatus(u16),

    /// Network or transport error. Retried on the next poll.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Invalid client configuration.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The client is offline and cannot initiate HTTP calls.
    #[error("client is in offline mode, it cannot initiate HTTP calls")]
    Offline,

    /// The client uses local-only flag overrides and never makes HTTP requests.
    #[error("client uses local-only flag overrides, it cannot initiate HTTP calls")]
    LocalOnly,

    /// The client has been closed.
    #[error("client is closed")]
    ClientClosed,

    /// A cached configuration entry could not be parsed.
    #[error("invalid cache entry: {0}")]
    CacheEntry(String),

    /// A blocking method was called from a thread driven by an async runtime.
    #[error("blocking call made from an async context")]
    BlockingInAsyncContext,

    /// A user-supplied cache implementation panicked.
    #[error("cache implementation panicked")]
    CachePanicked,

    /// A background fetch task panicked.
    #[error("background fetch task panicked")]
    FetchTaskPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Returns `true` if the error is transient and the next fetch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::HttpStatus(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedDocument(Arc::new(value))
    }
}
