//! Feature flag client: configuration polling and flag evaluation.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that keeps a remote configuration document up to date
//! and evaluates typed feature flag values against it. Each evaluation may take a [`User`]
//! describing who the flag is evaluated for; targeting rules compare user attributes and
//! percentage options split users into stable buckets.
//!
//! How the configuration is kept fresh is decided by the [`PollingMode`]:
//! - [`PollingMode::AutoPoll`] fetches in the background on a fixed interval.
//! - [`PollingMode::LazyLoad`] fetches on demand when the cached document expires.
//! - [`PollingMode::Manual`] only fetches on [`Client::force_refresh()`].
//!
//! Fetches are conditional (ETag based), so an unchanged configuration costs a `304` response.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Value retrieval never fails: on any error the client logs, notifies `on_error` hooks and
//! returns the default supplied by the caller. Use [`Client::get_value_details()`] to see why a
//! default was served.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! target `flagpole`. Consider integrating a `log`-compatible logger implementation for better
//! visibility into client operations. [`LogLevel`] filters what the client emits.
//!
//! # Examples
//!
//! ```no_run
//! use flagpole::{ClientConfig, User};
//!
//! let client = ClientConfig::from_sdk_key("sdk-key").to_client()?;
//! let user = User::builder("user-42").email("someone@example.com").build();
//! let enabled = client.get_value("isFeatureEnabled", Some(&user), false);
//! client.close();
//! # Ok::<(), flagpole::Error>(())
//! ```
//!
//! More examples can be found in the `demos` directory of the repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod cache;
mod client;
mod config;
mod config_service;
mod configuration;
mod configuration_fetcher;
mod configuration_store;
mod error;
mod eval;
mod hooks;
mod logger;
mod models;
mod overrides;
mod polling_mode;
mod registry;
mod rules;
mod sharder;
mod user;

pub use cache::{ConfigCache, FileCache, InMemoryCache, NoopCache};
pub use client::Client;
pub use config::{ClientConfig, DataGovernance};
pub use configuration::Configuration;
pub use configuration_store::ConfigurationStore;
pub use error::{Error, Result};
pub use eval::{EvaluationDetails, EvaluationResult, FlagValue};
pub use hooks::{ClientCacheState, Hooks};
pub use logger::LogLevel;
pub use models::{
    Config, PercentageOption, Preferences, RedirectMode, RolloutRule, Setting, SettingType,
    SettingValue, TryParse, Value,
};
pub use overrides::{FlagOverrides, OverrideBehavior};
pub use polling_mode::{PollingMode, RefreshResult};
pub use registry::ClientRegistry;
pub use rules::Comparator;
pub use user::{AttributeValue, User, UserBuilder};
