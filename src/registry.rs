//! Registry of clients keyed by SDK key.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use once_cell::sync::Lazy;

use crate::{Client, ClientConfig, Result};

pub(crate) type ClientMap = Mutex<HashMap<String, Arc<Client>>>;

static GLOBAL: Lazy<ClientRegistry> = Lazy::new(ClientRegistry::new);

/// Holds at most one client per SDK key.
///
/// Closing a client removes it from the registry it was created by.
///
/// # Examples
/// ```
/// # use flagpole::{ClientConfig, ClientRegistry, PollingMode};
/// let registry = ClientRegistry::new();
/// let mut config = ClientConfig::from_sdk_key("sdk-key");
/// config.polling_mode(PollingMode::manual()).offline(true);
///
/// let client = registry.get_with_config(config).unwrap();
/// let same = registry.get("sdk-key").unwrap();
/// assert!(std::sync::Arc::ptr_eq(&client, &same));
/// registry.close_all();
/// ```
pub struct ClientRegistry {
    clients: Arc<ClientMap>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            clients: Arc::default(),
        }
    }

    /// The process-wide registry used by [`Client::get()`].
    pub fn global() -> &'static ClientRegistry {
        &GLOBAL
    }

    /// Get the client for `sdk_key`, creating it with the default configuration if needed.
    pub fn get(&self, sdk_key: &str) -> Result<Arc<Client>> {
        self.get_or_create(sdk_key, || ClientConfig::from_sdk_key(sdk_key), false)
    }

    /// Get the client for the configured SDK key, creating it from `config` if needed.
    ///
    /// If a client already exists, it is returned unchanged and `config` is ignored with a
    /// warning.
    pub fn get_with_config(&self, config: ClientConfig) -> Result<Arc<Client>> {
        let sdk_key = config.sdk_key().to_owned();
        self.get_or_create(&sdk_key, move || config, true)
    }

    /// Close and remove every client.
    pub fn close_all(&self) {
        let clients: Vec<Arc<Client>> = {
            let mut clients = self.lock();
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.close();
        }
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no client is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_create(
        &self,
        sdk_key: &str,
        config: impl FnOnce() -> ClientConfig,
        explicit_config: bool,
    ) -> Result<Arc<Client>> {
        if let Some(client) = self.lock().get(sdk_key).cloned() {
            if explicit_config {
                warn_existing();
            }
            return Ok(client);
        }

        // Construction may run hooks, which may call back into the registry.
        let client = Arc::new(Client::new(config())?);

        let existing = {
            let mut clients = self.lock();
            match clients.get(sdk_key) {
                Some(existing) => Some(existing.clone()),
                None => {
                    client.attach_registry(Arc::downgrade(&self.clients));
                    clients.insert(sdk_key.to_owned(), client.clone());
                    None
                }
            }
        };

        match existing {
            Some(existing) => {
                // Another thread registered a client for the key in the meantime.
                client.close();
                if explicit_config {
                    warn_existing();
                }
                Ok(existing)
            }
            None => Ok(client),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn warn_existing() {
    log::warn!(target: "flagpole", event_id = 3000;
        "there is an existing client instance for the specified SDK key; \
         the new configuration is ignored");
}

impl Default for ClientRegistry {
    fn default() -> Self {
        ClientRegistry::new()
    }
}
