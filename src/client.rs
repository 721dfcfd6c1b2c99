use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock, Weak,
    },
};

use crate::{
    cache::cache_key,
    config_service::{ConfigService, ConfigServiceConfig},
    configuration::Configuration,
    configuration_fetcher::{ConfigurationFetcher, ConfigurationFetcherConfig},
    configuration_store::ConfigurationStore,
    eval::{eval_setting, EvaluationDetails, FlagValue},
    hooks::{ClientCacheState, Hooks},
    logger::ClientLogger,
    models::{Setting, SettingValue, TryParse},
    overrides::FlagOverrides,
    polling_mode::RefreshResult,
    registry::{ClientMap, ClientRegistry},
    sharder::Sha1Sharder,
    ClientConfig, Error, Result, User,
};

/// A feature flag client.
///
/// The client keeps a configuration snapshot up to date according to its
/// [`PollingMode`](crate::PollingMode) and evaluates flags against it. Value requests never fail:
/// on any error they log, notify `on_error` hooks and return the supplied default.
///
/// Blocking methods (`get_value()`, ...) may be called from any thread that is not driven by an
/// async runtime. Inside async code, use the `_async` variants: they never block the executor.
///
/// # Examples
/// ```no_run
/// # use flagpole::{Client, ClientConfig, User};
/// let client = ClientConfig::from_sdk_key("sdk-key").to_client().unwrap();
/// let user = User::builder("user-42").email("someone@example.com").build();
/// if client.get_value("isFeatureEnabled", Some(&user), false) {
///     // ...
/// }
/// client.close();
/// ```
pub struct Client {
    sdk_key: String,
    store: Arc<ConfigurationStore>,
    /// `None` with local-only overrides: such clients never fetch.
    service: Option<ConfigService>,
    overrides: Option<FlagOverrides>,
    hooks: Arc<Hooks>,
    logger: Arc<ClientLogger>,
    default_user: RwLock<Option<User>>,
    closed: AtomicBool,
    registry: Mutex<Option<Weak<ClientMap>>>,
    /// Hosts the poll task and every fetch. `None` for local-only clients.
    runtime: Option<tokio::runtime::Runtime>,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] or [`Error::InvalidBaseUrl`] if the configuration is invalid.
    /// - [`Error::Io`] if the background runtime failed to start.
    pub fn new(config: ClientConfig) -> Result<Client> {
        config.validate()?;

        let logger = Arc::new(ClientLogger::new(config.log_level, config.hooks.clone()));
        let store = Arc::new(ConfigurationStore::with_hooks(config.hooks.clone()));

        if config.is_local_only() {
            config
                .hooks
                .invoke_on_client_ready(ClientCacheState::HasLocalOverrideFlagDataOnly);
            return Ok(Client {
                sdk_key: config.sdk_key,
                store,
                service: None,
                overrides: config.flag_overrides,
                hooks: config.hooks,
                logger,
                default_user: RwLock::new(config.default_user),
                closed: AtomicBool::new(false),
                registry: Mutex::new(None),
                runtime: None,
            });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("flagpole-worker")
            .enable_all()
            .build()?;

        let (base_url, base_url_overridden) = config.effective_base_url();
        let fetcher = ConfigurationFetcher::new(
            ConfigurationFetcherConfig {
                sdk_key: config.sdk_key.clone(),
                base_url,
                base_url_overridden,
                mode: config.polling_mode.identifier(),
                request_timeout: config.request_timeout,
            },
            logger.clone(),
        )?;

        let service = ConfigService::start(
            ConfigServiceConfig {
                mode: config.polling_mode,
                cache: config.cache,
                cache_key: cache_key(&config.sdk_key),
                offline: config.offline,
                has_overrides: config.flag_overrides.is_some(),
            },
            store.clone(),
            fetcher,
            config.hooks.clone(),
            logger.clone(),
            runtime.handle().clone(),
        );

        Ok(Client {
            sdk_key: config.sdk_key,
            store,
            service: Some(service),
            overrides: config.flag_overrides,
            hooks: config.hooks,
            logger,
            default_user: RwLock::new(config.default_user),
            closed: AtomicBool::new(false),
            registry: Mutex::new(None),
            runtime: Some(runtime),
        })
    }

    /// Get the client registered for `sdk_key` in the process-wide registry, creating it with
    /// the default configuration if there is none.
    pub fn get(sdk_key: &str) -> Result<Arc<Client>> {
        ClientRegistry::global().get(sdk_key)
    }

    /// Close every client in the process-wide registry.
    pub fn close_all() {
        ClientRegistry::global().close_all()
    }

    /// SDK key of the client.
    pub fn sdk_key(&self) -> &str {
        &self.sdk_key
    }

    /// The configuration values are currently evaluated against. Never fetches.
    pub fn snapshot(&self) -> Option<Arc<Configuration>> {
        self.store.get()
    }

    /// Hooks of the client. Hooks added here take effect immediately.
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Evaluate a flag, blocking until the configuration is available per the polling mode.
    ///
    /// Returns `default` if the flag is missing, has a different type, or evaluation fails.
    ///
    /// ```no_run
    /// # use flagpole::{ClientConfig, User};
    /// # let client = ClientConfig::from_sdk_key("sdk-key").to_client().unwrap();
    /// let enabled: bool = client.get_value("isFeatureEnabled", None, false);
    /// let plan: String = client.get_value("plan", Some(&User::new("id")), "free".to_owned());
    /// ```
    pub fn get_value<T: FlagValue>(&self, key: &str, user: Option<&User>, default: T) -> T {
        self.get_value_details(key, user, default).value
    }

    /// Like [`Client::get_value()`], but returns evaluation details.
    pub fn get_value_details<T: FlagValue>(
        &self,
        key: &str,
        user: Option<&User>,
        default: T,
    ) -> EvaluationDetails<T> {
        let configuration = self.load_configuration_blocking();
        self.evaluate(key, user, default, configuration.as_deref())
    }

    /// Evaluate a flag without blocking the calling thread.
    pub async fn get_value_async<T: FlagValue>(
        &self,
        key: &str,
        user: Option<&User>,
        default: T,
    ) -> T {
        self.get_value_details_async(key, user, default).await.value
    }

    /// Like [`Client::get_value_async()`], but returns evaluation details.
    pub async fn get_value_details_async<T: FlagValue>(
        &self,
        key: &str,
        user: Option<&User>,
        default: T,
    ) -> EvaluationDetails<T> {
        let configuration = self.load_configuration().await;
        self.evaluate(key, user, default, configuration.as_deref())
    }

    /// Sorted keys of all flags.
    pub fn get_all_keys(&self) -> Vec<String> {
        let configuration = self.load_configuration_blocking();
        self.keys(configuration.as_deref())
    }

    /// Async variant of [`Client::get_all_keys()`].
    pub async fn get_all_keys_async(&self) -> Vec<String> {
        let configuration = self.load_configuration().await;
        self.keys(configuration.as_deref())
    }

    /// Evaluate every flag for `user`. Flags that fail to evaluate are left out.
    pub fn get_all_values(&self, user: Option<&User>) -> HashMap<String, SettingValue> {
        let configuration = self.load_configuration_blocking();
        self.evaluate_all(user, configuration.as_deref())
    }

    /// Async variant of [`Client::get_all_values()`].
    pub async fn get_all_values_async(&self, user: Option<&User>) -> HashMap<String, SettingValue> {
        let configuration = self.load_configuration().await;
        self.evaluate_all(user, configuration.as_deref())
    }

    /// Find the flag key and value served under `variation_id`.
    pub fn get_key_and_value(&self, variation_id: &str) -> Option<(String, SettingValue)> {
        let configuration = self.load_configuration_blocking();
        self.find_variation(variation_id, configuration.as_deref())
    }

    /// Async variant of [`Client::get_key_and_value()`].
    pub async fn get_key_and_value_async(
        &self,
        variation_id: &str,
    ) -> Option<(String, SettingValue)> {
        let configuration = self.load_configuration().await;
        self.find_variation(variation_id, configuration.as_deref())
    }

    /// Fetch the configuration now, regardless of the polling mode, and wait for the result.
    pub fn force_refresh(&self) -> RefreshResult {
        let Some(service) = self.refreshable_service() else {
            return self.refresh_unavailable();
        };
        let service = service.clone();
        self.block_on_runtime(async move { service.refresh().await })
            .unwrap_or_else(RefreshResult::failure)
    }

    /// Async variant of [`Client::force_refresh()`].
    pub async fn force_refresh_async(&self) -> RefreshResult {
        let Some(service) = self.refreshable_service() else {
            return self.refresh_unavailable();
        };
        let refresh = service.refresh();
        match service.runtime().spawn(refresh).await {
            Ok(result) => result,
            Err(_) => RefreshResult::failure(Error::ClientClosed),
        }
    }

    /// Set the user used when value requests don't pass one.
    pub fn set_default_user(&self, user: User) {
        *self
            .default_user
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(user);
    }

    /// Forget the default user.
    pub fn clear_default_user(&self) {
        *self
            .default_user
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Resume network communication. Restarts polling in auto poll mode.
    pub fn set_online(&self) {
        match &self.service {
            Some(service) => service.set_online(),
            None => self.logger.warn(
                3202,
                "client uses local-only flag overrides; set_online() has no effect",
            ),
        }
    }

    /// Stop all network communication. Values are served from the cache.
    pub fn set_offline(&self) {
        if let Some(service) = &self.service {
            service.set_offline();
        }
    }

    /// Returns `true` if the client does not communicate over the network.
    pub fn is_offline(&self) -> bool {
        self.service
            .as_ref()
            .map_or(true, |service| service.is_offline())
    }

    /// Returns `true` once [`Client::close()`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the client: stop polling, release network resources, clear hooks and remove the
    /// client from the registry.
    ///
    /// Values requested afterwards are served from the last configuration. Calling `close()`
    /// again has no effect. It is safe to call from a hook.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(service) = &self.service {
            service.close();
        }
        self.hooks.clear();
        self.deregister();
        log::debug!(target: "flagpole", sdk_key:display = self.masked_sdk_key(); "client closed");
    }

    pub(crate) fn attach_registry(&self, registry: Weak<ClientMap>) {
        *self.registry.lock().unwrap_or_else(PoisonError::into_inner) = Some(registry);
    }

    fn deregister(&self) {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(clients) = registry.and_then(|registry| registry.upgrade()) else {
            return;
        };
        let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
        let is_self = clients
            .get(&self.sdk_key)
            .is_some_and(|client| std::ptr::eq(Arc::as_ptr(client), self));
        if is_self {
            // The removed `Arc` may be the last one; drop it after releasing the lock.
            let removed = clients.remove(&self.sdk_key);
            drop(clients);
            drop(removed);
        }
    }

    fn masked_sdk_key(&self) -> String {
        let visible = self.sdk_key.len().saturating_sub(6);
        let suffix = self.sdk_key.get(visible..).unwrap_or_default();
        format!("****{suffix}")
    }

    fn refreshable_service(&self) -> Option<&ConfigService> {
        self.service.as_ref().filter(|_| !self.is_closed())
    }

    fn refresh_unavailable(&self) -> RefreshResult {
        let err = if self.is_closed() {
            Error::ClientClosed
        } else {
            Error::LocalOnly
        };
        self.logger.warn(3202, format_args!("cannot refresh: {err}"));
        RefreshResult::failure(err)
    }

    /// Run `future` on the client runtime and block until it completes.
    ///
    /// Refuses to block a thread driven by an async runtime.
    fn block_on_runtime<F>(&self, future: F) -> std::result::Result<F::Output, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let Some(runtime) = &self.runtime else {
            return Err(Error::LocalOnly);
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            self.logger.warn(
                3203,
                "blocking call made from an async context; use the `_async` variant instead",
            );
            return Err(Error::BlockingInAsyncContext);
        }

        let (sender, receiver) = std::sync::mpsc::sync_channel(1);
        runtime.spawn(async move {
            let _ = sender.send(future.await);
        });
        receiver.recv().map_err(|_| Error::ClientClosed)
    }

    fn load_configuration_blocking(&self) -> Option<Arc<Configuration>> {
        if let Some(service) = &self.service {
            if !service.is_ready_now() {
                let service = service.clone();
                // On failure (e.g. called from async code) the current snapshot is served.
                let _ = self.block_on_runtime(async move { service.prepare().await });
            }
        }
        self.store.get()
    }

    async fn load_configuration(&self) -> Option<Arc<Configuration>> {
        if let Some(service) = &self.service {
            if !service.is_ready_now() {
                let task = service.clone();
                let _ = service
                    .runtime()
                    .spawn(async move { task.prepare().await })
                    .await;
            }
        }
        self.store.get()
    }

    fn lookup_setting<'a>(
        &'a self,
        key: &str,
        configuration: Option<&'a Configuration>,
    ) -> Result<&'a TryParse<Setting>> {
        let setting = match &self.overrides {
            Some(overrides) => overrides.lookup(key, configuration.map(|c| &c.config)),
            None => configuration.and_then(|c| c.get_setting(key)),
        };

        setting.ok_or_else(|| {
            if configuration.is_none() && self.overrides.is_none() {
                Error::ConfigNotAvailable
            } else {
                Error::KeyNotFound {
                    key: key.to_owned(),
                    available: self.keys(configuration),
                }
            }
        })
    }

    fn keys(&self, configuration: Option<&Configuration>) -> Vec<String> {
        match &self.overrides {
            Some(overrides) => overrides.merged_keys(configuration.map(|c| &c.config)),
            None => configuration.map(Configuration::keys).unwrap_or_default(),
        }
    }

    fn effective_user(&self, user: Option<&User>) -> Option<User> {
        match user {
            Some(user) => Some(user.clone()),
            None => self
                .default_user
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn evaluate<T: FlagValue>(
        &self,
        key: &str,
        user: Option<&User>,
        default: T,
        configuration: Option<&Configuration>,
    ) -> EvaluationDetails<T> {
        let user = self.effective_user(user);
        let fetch_time = configuration.map(|c| c.fetched_at);

        let result = self.lookup_setting(key, configuration).and_then(|setting| {
            eval_setting(
                key,
                setting,
                Some(T::SETTING_TYPE),
                user.as_ref(),
                &Sha1Sharder,
                &self.logger,
            )
        });

        let details = match result {
            Ok(result) => match T::from_setting_value(result.value.clone()) {
                Some(value) => EvaluationDetails::from_result(key, value, result, user, fetch_time),
                None => {
                    let err = Error::TypeMismatch {
                        key: key.to_owned(),
                        requested: T::SETTING_TYPE,
                        actual: result.value.setting_type(),
                    };
                    self.report_evaluation_error(key, &default, &err);
                    EvaluationDetails::from_error(key, default, err, user, fetch_time)
                }
            },
            Err(err) => {
                self.report_evaluation_error(key, &default, &err);
                EvaluationDetails::from_error(key, default, err, user, fetch_time)
            }
        };

        if self.hooks.has_flag_evaluated_hooks() {
            self.hooks
                .invoke_on_flag_evaluated(&details.clone().map(T::into_setting_value));
        }

        details
    }

    fn report_evaluation_error<T: FlagValue>(&self, key: &str, default: &T, err: &Error) {
        let default = default.clone().into_setting_value();
        let event_id = match err {
            Error::ConfigNotAvailable => 1000,
            Error::KeyNotFound { .. } => 1001,
            _ => 1002,
        };
        self.logger.error(
            event_id,
            format_args!(
                "failed to evaluate setting {key:?}; returning the default value '{default}'"
            ),
            Some(err),
        );
    }

    fn evaluate_all(
        &self,
        user: Option<&User>,
        configuration: Option<&Configuration>,
    ) -> HashMap<String, SettingValue> {
        let user = self.effective_user(user);
        let mut values = HashMap::new();
        for key in self.keys(configuration) {
            let result = self.lookup_setting(&key, configuration).and_then(|setting| {
                eval_setting(
                    &key,
                    setting,
                    None,
                    user.as_ref(),
                    &Sha1Sharder,
                    &self.logger,
                )
            });
            match result {
                Ok(result) => {
                    if self.hooks.has_flag_evaluated_hooks() {
                        let fetch_time = configuration.map(|c| c.fetched_at);
                        let details = EvaluationDetails::from_result(
                            &key,
                            result.value.clone(),
                            result.clone(),
                            user.clone(),
                            fetch_time,
                        );
                        self.hooks.invoke_on_flag_evaluated(&details);
                    }
                    values.insert(key, result.value);
                }
                Err(err) => self.logger.error(
                    1002,
                    format_args!("failed to evaluate setting {key:?}"),
                    Some(&err),
                ),
            }
        }
        values
    }

    fn find_variation(
        &self,
        variation_id: &str,
        configuration: Option<&Configuration>,
    ) -> Option<(String, SettingValue)> {
        for key in self.keys(configuration) {
            let Ok(TryParse::Parsed(setting)) = self.lookup_setting(&key, configuration) else {
                continue;
            };
            let found = setting
                .variations()
                .find(|(id, _)| *id == Some(variation_id))
                .and_then(|(_, value)| value.to_setting_value(setting.setting_type));
            if let Some(value) = found {
                return Some((key, value));
            }
        }

        self.logger.error(
            2011,
            format_args!("could not find the setting for the variation id {variation_id:?}"),
            None,
        );
        None
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use crate::{
        ClientConfig, Error, FlagOverrides, OverrideBehavior, PollingMode, SettingValue, User,
    };

    fn local_client() -> crate::Client {
        let mut config = ClientConfig::from_sdk_key("local");
        config.flag_overrides(
            FlagOverrides::from_json(
                include_str!("../tests/data/config/sample_v5.json"),
                OverrideBehavior::LocalOnly,
            )
            .unwrap(),
        );
        config.to_client().unwrap()
    }

    #[test]
    fn evaluates_local_flags() {
        let client = local_client();
        let user = User::builder("alice").email("alice@example.com").build();
        assert!(client.get_value("isFeatureEnabled", Some(&user), false));
        assert!(!client.get_value("isFeatureEnabled", None, true));
        assert_eq!(client.get_value("discount", None, 0.0), 12.5);
        assert_eq!(
            client.get_value("rollout", Some(&User::new("user-4")), String::new()),
            "c"
        );
        assert!(client.is_offline());
    }

    #[test]
    fn unknown_key_returns_default() {
        let client = local_client();
        let details = client.get_value_details("missing", None, 42_i64);
        assert_eq!(details.value, 42);
        assert!(details.is_default_value);
        match details.error {
            Some(Error::KeyNotFound { key, available }) => {
                assert_eq!(key, "missing");
                assert!(available.contains(&"isFeatureEnabled".to_owned()));
            }
            other => panic!("expected KeyNotFound, got {other:?}"),
        }
    }

    #[test]
    fn type_mismatch_returns_default() {
        let client = local_client();
        let details = client.get_value_details("isFeatureEnabled", None, "x".to_owned());
        assert_eq!(details.value, "x");
        assert!(matches!(details.error, Some(Error::TypeMismatch { .. })));
    }

    #[test]
    fn default_user() {
        let client = local_client();
        client.set_default_user(User::builder("bob").email("bob@example.com").build());
        assert!(client.get_value("isFeatureEnabled", None, false));

        // Explicit user wins over the default one.
        let other = User::builder("eve").email("eve@test.com").build();
        assert!(!client.get_value("isFeatureEnabled", Some(&other), false));

        client.clear_default_user();
        assert!(!client.get_value("isFeatureEnabled", None, false));
    }

    #[test]
    fn all_values_and_keys() {
        let client = local_client();
        let keys = client.get_all_keys();
        assert_eq!(keys.len(), 6);

        let values = client.get_all_values(Some(&User::new("user-1")));
        assert_eq!(values.get("rollout"), Some(&SettingValue::from("a")));
        assert_eq!(values.get("betaRollout"), Some(&SettingValue::Int(0)));
    }

    #[test]
    fn key_and_value_by_variation_id() {
        let client = local_client();
        assert_eq!(
            client.get_key_and_value("6ada5ff2"),
            Some(("isFeatureEnabled".to_owned(), SettingValue::Boolean(true)))
        );
        assert_eq!(
            client.get_key_and_value("beta-2"),
            Some(("betaRollout".to_owned(), SettingValue::Int(2)))
        );
        assert_eq!(client.get_key_and_value("nope"), None);
    }

    #[test]
    fn flag_evaluated_hook() {
        let client = local_client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            client.hooks().add_on_flag_evaluated(move |details| {
                seen.lock()
                    .unwrap()
                    .push((details.key.clone(), details.value.clone()));
            });
        }

        client.get_value("discount", None, 0.0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("discount".to_owned(), SettingValue::Double(12.5))]
        );
    }

    #[test]
    fn local_only_cannot_refresh() {
        let client = local_client();
        let result = client.force_refresh();
        assert!(matches!(result.error(), Some(Error::LocalOnly)));
    }

    #[test]
    fn close_is_idempotent_and_callable_from_hook() {
        let client = Arc::new(local_client());
        let errors = Arc::new(AtomicUsize::new(0));
        {
            let weak = Arc::downgrade(&client);
            let errors = errors.clone();
            client.hooks().add_on_error(move |_, _| {
                errors.fetch_add(1, Ordering::SeqCst);
                if let Some(client) = weak.upgrade() {
                    client.close();
                }
            });
        }

        // Unknown key reports an error, whose hook closes the client.
        assert_eq!(client.get_value("missing", None, 1_i64), 1);
        assert!(client.is_closed());
        client.close();

        // Hooks are cleared on close; values are still served.
        assert_eq!(client.get_value("missing", None, 2_i64), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(client.get_value("discount", None, 0.0), 12.5);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = ClientConfig::from_sdk_key("key");
        config.polling_mode(PollingMode::lazy_load(std::time::Duration::ZERO));
        assert!(matches!(config.to_client(), Err(Error::InvalidConfig(_))));
    }
}
