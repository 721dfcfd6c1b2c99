use std::sync::{Arc, RwLock};

use crate::{configuration::Configuration, hooks::Hooks};

/// `ConfigurationStore` provides a Sync storage for the current configuration that allows
/// concurrent access for readers and writers.
///
/// Readers get an `Arc` snapshot and never observe a partially updated document.
#[derive(Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<Configuration>>>,
    hooks: Arc<Hooks>,
}

impl ConfigurationStore {
    /// Create an empty store without hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that reports content changes to `hooks`.
    pub(crate) fn with_hooks(hooks: Arc<Hooks>) -> Self {
        Self {
            configuration: RwLock::new(None),
            hooks,
        }
    }

    /// Current configuration snapshot, if any.
    pub fn get(&self) -> Option<Arc<Configuration>> {
        // self.configuration.read() should always return Ok(). Err() is possible only if the lock
        // is poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let configuration = self.configuration.read().ok()?;
        configuration.clone()
    }

    /// Replace the current configuration, returning `true` if its content changed.
    ///
    /// `on_config_changed` hooks fire after the lock is released, and only when the content
    /// differs from the previous document.
    pub fn set(&self, configuration: Arc<Configuration>) -> bool {
        let previous = {
            let Ok(mut slot) = self.configuration.write() else {
                return false;
            };
            std::mem::replace(&mut *slot, Some(configuration.clone()))
        };

        let changed = previous.map_or(true, |previous| !previous.same_content(&configuration));
        if changed {
            self.hooks.invoke_on_config_changed(&configuration);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use chrono::Utc;

    use super::ConfigurationStore;
    use crate::{configuration::Configuration, hooks::Hooks};

    fn configuration(etag: &str) -> Arc<Configuration> {
        Arc::new(
            Configuration::from_json(r#"{"f":{}}"#, Some(etag.to_owned()), Utc::now()).unwrap(),
        )
    }

    #[test]
    fn can_set_configuration_from_another_thread() {
        let store = Arc::new(ConfigurationStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set(configuration("a"));
            })
            .join();
        }

        assert!(store.get().is_some());
    }

    #[test]
    fn hooks_fire_on_content_change_only() {
        let changes = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(Hooks::default());
        {
            let changes = changes.clone();
            hooks.add_on_config_changed(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            });
        }
        let store = ConfigurationStore::with_hooks(hooks);

        assert!(store.set(configuration("a")));
        assert!(!store.set(configuration("a")));
        assert!(store.set(configuration("b")));
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hook_can_read_store() {
        let hooks = Arc::new(Hooks::default());
        let store = Arc::new(ConfigurationStore::with_hooks(hooks.clone()));
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let store = Arc::downgrade(&store);
            let seen = seen.clone();
            hooks.add_on_config_changed(move |_| {
                if let Some(store) = store.upgrade() {
                    if store.get().is_some() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }

        store.set(configuration("a"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
