//! Client event hooks.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use crate::{configuration::Configuration, models::SettingValue, Error, EvaluationDetails};

/// State of the locally available flag data at the time the client became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCacheState {
    /// No flag data is available; evaluations return defaults.
    NoFlagData,
    /// Only local flag overrides are available.
    HasLocalOverrideFlagDataOnly,
    /// Flag data comes from the cache and may be stale.
    HasCachedFlagDataOnly,
    /// Flag data is up to date with respect to the polling policy.
    HasUpToDateFlagData,
}

type ReadyHook = Arc<dyn Fn(ClientCacheState) + Send + Sync>;
type ConfigChangedHook = Arc<dyn Fn(&Configuration) + Send + Sync>;
type FlagEvaluatedHook = Arc<dyn Fn(&EvaluationDetails<SettingValue>) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str, Option<&Error>) + Send + Sync>;

/// Callbacks invoked on client events.
///
/// Hooks may be added before the client is created (through
/// [`ClientConfig::hooks()`](crate::ClientConfig::hooks)) or at any time later through
/// [`Client::hooks()`](crate::Client::hooks). They are invoked without any internal lock held, so
/// they may call back into the client, including [`Client::close()`](crate::Client::close).
///
/// # Examples
/// ```
/// # use flagpole::Hooks;
/// let hooks = Hooks::default();
/// hooks
///     .add_on_config_changed(|configuration| println!("new config: {:?}", configuration.etag))
///     .add_on_error(|message, _err| eprintln!("{message}"));
/// ```
#[derive(Default)]
pub struct Hooks {
    on_client_ready: RwLock<Vec<ReadyHook>>,
    on_config_changed: RwLock<Vec<ConfigChangedHook>>,
    on_flag_evaluated: RwLock<Vec<FlagEvaluatedHook>>,
    on_error: RwLock<Vec<ErrorHook>>,
}

impl Hooks {
    /// Called once when the client reaches a usable state.
    pub fn add_on_client_ready(
        &self,
        hook: impl Fn(ClientCacheState) + Send + Sync + 'static,
    ) -> &Self {
        let hook: ReadyHook = Arc::new(hook);
        push(&self.on_client_ready, hook);
        self
    }

    /// Called when a configuration with different content becomes current.
    pub fn add_on_config_changed(
        &self,
        hook: impl Fn(&Configuration) + Send + Sync + 'static,
    ) -> &Self {
        let hook: ConfigChangedHook = Arc::new(hook);
        push(&self.on_config_changed, hook);
        self
    }

    /// Called after every flag evaluation.
    pub fn add_on_flag_evaluated(
        &self,
        hook: impl Fn(&EvaluationDetails<SettingValue>) + Send + Sync + 'static,
    ) -> &Self {
        let hook: FlagEvaluatedHook = Arc::new(hook);
        push(&self.on_flag_evaluated, hook);
        self
    }

    /// Called with every error the client reports.
    pub fn add_on_error(&self, hook: impl Fn(&str, Option<&Error>) + Send + Sync + 'static) -> &Self {
        let hook: ErrorHook = Arc::new(hook);
        push(&self.on_error, hook);
        self
    }

    /// Remove all registered hooks.
    pub fn clear(&self) {
        clear(&self.on_client_ready);
        clear(&self.on_config_changed);
        clear(&self.on_flag_evaluated);
        clear(&self.on_error);
    }

    pub(crate) fn invoke_on_client_ready(&self, state: ClientCacheState) {
        for hook in snapshot(&self.on_client_ready) {
            guarded("on_client_ready", || hook(state));
        }
    }

    pub(crate) fn invoke_on_config_changed(&self, configuration: &Configuration) {
        for hook in snapshot(&self.on_config_changed) {
            guarded("on_config_changed", || hook(configuration));
        }
    }

    pub(crate) fn invoke_on_flag_evaluated(&self, details: &EvaluationDetails<SettingValue>) {
        for hook in snapshot(&self.on_flag_evaluated) {
            guarded("on_flag_evaluated", || hook(details));
        }
    }

    pub(crate) fn invoke_on_error(&self, message: &str, error: Option<&Error>) {
        for hook in snapshot(&self.on_error) {
            guarded("on_error", || hook(message, error));
        }
    }

    pub(crate) fn has_flag_evaluated_hooks(&self) -> bool {
        !self
            .on_flag_evaluated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

fn push<T>(list: &RwLock<Vec<T>>, hook: T) {
    list.write().unwrap_or_else(PoisonError::into_inner).push(hook);
}

fn clear<T>(list: &RwLock<Vec<T>>) {
    list.write().unwrap_or_else(PoisonError::into_inner).clear();
}

/// Copy the hook list out so that no lock is held while hooks run.
fn snapshot<T: Clone>(list: &RwLock<Vec<T>>) -> Vec<T> {
    list.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn guarded(hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!(target: "flagpole", hook; "hook panicked");
    }
}
