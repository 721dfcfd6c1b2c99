use std::{sync::Arc, time::Duration};

use url::Url;

use crate::{
    cache::{ConfigCache, NoopCache},
    hooks::Hooks,
    logger::LogLevel,
    overrides::FlagOverrides,
    polling_mode::PollingMode,
    Client, Error, Result, User,
};

/// CDN region the configuration is served from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataGovernance {
    /// Global CDN.
    #[default]
    Global,
    /// CDN nodes in the EU only.
    EuOnly,
}

impl DataGovernance {
    /// Base URL of the region.
    pub fn base_url(self) -> &'static str {
        match self {
            DataGovernance::Global => "https://cdn-global.configcat.com",
            DataGovernance::EuOnly => "https://cdn-eu.configcat.com",
        }
    }
}

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagpole::{ClientConfig, LogLevel, PollingMode};
/// let mut config = ClientConfig::from_sdk_key("sdk-key");
/// config
///     .polling_mode(PollingMode::lazy_load(Duration::from_secs(120)))
///     .log_level(LogLevel::Info)
///     .offline(true);
/// config.hooks().add_on_error(|message, _err| eprintln!("{message}"));
/// ```
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) polling_mode: PollingMode,
    pub(crate) base_url: Option<String>,
    pub(crate) data_governance: DataGovernance,
    pub(crate) log_level: LogLevel,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) cache: Arc<dyn ConfigCache>,
    pub(crate) flag_overrides: Option<FlagOverrides>,
    pub(crate) default_user: Option<User>,
    pub(crate) offline: bool,
    pub(crate) request_timeout: Duration,
}

impl ClientConfig {
    /// Default timeout of configuration requests.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use flagpole::ClientConfig;
    /// ClientConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            polling_mode: PollingMode::default(),
            base_url: None,
            data_governance: DataGovernance::default(),
            log_level: LogLevel::default(),
            hooks: Arc::default(),
            cache: Arc::new(NoopCache),
            flag_overrides: None,
            default_user: None,
            offline: false,
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// SDK key the configuration was created with.
    pub fn sdk_key(&self) -> &str {
        &self.sdk_key
    }

    /// Set the polling mode. Defaults to auto poll every 60 seconds.
    pub fn polling_mode(&mut self, polling_mode: PollingMode) -> &mut Self {
        self.polling_mode = polling_mode;
        self
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(&mut self, base_url: impl Into<String>) -> &mut Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Select the CDN region. Ignored when a custom base URL is set.
    pub fn data_governance(&mut self, data_governance: DataGovernance) -> &mut Self {
        self.data_governance = data_governance;
        self
    }

    /// Set the minimum level of messages the client emits.
    pub fn log_level(&mut self, log_level: LogLevel) -> &mut Self {
        self.log_level = log_level;
        self
    }

    /// Hooks the client will invoke. Register them here to catch events fired during
    /// construction (e.g. `on_client_ready`).
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Set the external cache.
    pub fn cache(&mut self, cache: impl ConfigCache + 'static) -> &mut Self {
        self.cache = Arc::new(cache);
        self
    }

    /// Set local flag overrides.
    pub fn flag_overrides(&mut self, flag_overrides: FlagOverrides) -> &mut Self {
        self.flag_overrides = Some(flag_overrides);
        self
    }

    /// Set the user used when value requests don't pass one.
    pub fn default_user(&mut self, user: User) -> &mut Self {
        self.default_user = Some(user);
        self
    }

    /// Start the client in offline mode.
    pub fn offline(&mut self, offline: bool) -> &mut Self {
        self.offline = offline;
        self
    }

    /// Set the timeout of configuration requests.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = timeout;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use flagpole::{ClientConfig, Client};
    /// let mut config = ClientConfig::from_sdk_key("sdk-key");
    /// config.offline(true);
    /// let client: Client = config.to_client().unwrap();
    /// # client.close();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    /// Base URL requests start from, and whether it was set by the user.
    pub(crate) fn effective_base_url(&self) -> (String, bool) {
        match &self.base_url {
            Some(base_url) => (base_url.trim_end_matches('/').to_owned(), true),
            None => (self.data_governance.base_url().to_owned(), false),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.sdk_key.trim().is_empty() && !self.is_local_only() {
            return Err(Error::InvalidConfig("SDK key cannot be empty".to_owned()));
        }
        if let Some(base_url) = &self.base_url {
            Url::parse(base_url).map_err(Error::InvalidBaseUrl)?;
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "request timeout must be positive".to_owned(),
            ));
        }
        self.polling_mode.validate()
    }

    pub(crate) fn is_local_only(&self) -> bool {
        self.flag_overrides.as_ref().is_some_and(|overrides| {
            overrides.behavior() == crate::overrides::OverrideBehavior::LocalOnly
        })
    }
}
