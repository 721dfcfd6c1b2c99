//! Level-filtered client logging.
use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{hooks::Hooks, Error};

/// Minimum level of messages the client emits.
///
/// Filtering happens before messages reach the `log` facade, so the global logger may be
/// configured more verbosely without flooding it with client messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Everything, including the evaluation log of every flag.
    Debug,
    /// Informational messages and up.
    Info,
    /// Warnings and errors.
    #[default]
    Warning,
    /// Errors only.
    Error,
    /// Nothing. Errors are still delivered to `on_error` hooks.
    NoLog,
}

/// Logger shared by all components of a client.
pub(crate) struct ClientLogger {
    level: LogLevel,
    hooks: Arc<Hooks>,
}

impl ClientLogger {
    pub(crate) fn new(level: LogLevel, hooks: Arc<Hooks>) -> ClientLogger {
        ClientLogger { level, hooks }
    }

    pub(crate) fn enabled(&self, level: LogLevel) -> bool {
        self.level != LogLevel::NoLog && level >= self.level
    }

    pub(crate) fn debug(&self, event_id: u32, message: impl Display) {
        if self.enabled(LogLevel::Debug) {
            log::debug!(target: "flagpole", event_id; "{message}");
        }
    }

    pub(crate) fn info(&self, event_id: u32, message: impl Display) {
        if self.enabled(LogLevel::Info) {
            log::info!(target: "flagpole", event_id; "{message}");
        }
    }

    pub(crate) fn warn(&self, event_id: u32, message: impl Display) {
        if self.enabled(LogLevel::Warning) {
            log::warn!(target: "flagpole", event_id; "{message}");
        }
    }

    /// Log an error and forward it to `on_error` hooks.
    pub(crate) fn error(&self, event_id: u32, message: impl Display, error: Option<&Error>) {
        let message = message.to_string();
        if self.enabled(LogLevel::Error) {
            match error {
                Some(error) => {
                    log::error!(target: "flagpole", event_id; "{message} {error}")
                }
                None => log::error!(target: "flagpole", event_id; "{message}"),
            }
        }
        self.hooks.invoke_on_error(&message, error);
    }
}
