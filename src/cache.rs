//! Persistent storage for the serialized configuration.
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{sharder::sha1_hex, Result};

/// External cache for configuration entries.
///
/// The client reads the cache before deciding whether to fetch and writes every newly fetched
/// configuration back. Entries are opaque strings; implementations only need to store them.
/// Sharing one cache between processes lets them reuse each other's fetches.
pub trait ConfigCache: Send + Sync {
    /// Read the entry stored under `key`. `Ok(None)` if there is none.
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing the previous entry.
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

impl<T: ConfigCache + ?Sized> ConfigCache for Arc<T> {
    fn read(&self, key: &str) -> Result<Option<String>> {
        (**self).read(key)
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        (**self).write(key, value)
    }
}

/// Cache that stores nothing. Used by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl ConfigCache for NoopCache {
    fn read(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn write(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

/// Process-local cache backed by a hash map.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> InMemoryCache {
        InMemoryCache::default()
    }
}

impl ConfigCache for InMemoryCache {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Cache storing one file per entry in a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Store entries under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> FileCache {
        FileCache { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl ConfigCache for FileCache {
    fn read(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path(key), value)?;
        Ok(())
    }
}

/// Cache key for an SDK key. Hashed so that the key itself is never persisted.
pub(crate) fn cache_key(sdk_key: &str) -> String {
    sha1_hex(format!("{sdk_key}_config_v5.json_v2"))
}
