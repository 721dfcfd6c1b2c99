mod common;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use flagpole::{ClientCacheState, ConfigCache, FileCache, InMemoryCache, PollingMode, User};
use httpmock::prelude::*;

use common::{client_config, init_logger, serve_config, Recorder};

/// Cache that remembers everything written to it.
#[derive(Default)]
struct RecordingCache {
    entries: Mutex<HashMap<String, String>>,
}

impl RecordingCache {
    fn single_entry(&self) -> String {
        let entries = self.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        entries.values().next().unwrap().clone()
    }
}

impl ConfigCache for RecordingCache {
    fn read(&self, key: &str) -> flagpole::Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> flagpole::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Cache whose storage is unavailable.
struct BrokenCache;

impl ConfigCache for BrokenCache {
    fn read(&self, _key: &str) -> flagpole::Result<Option<String>> {
        Err(std::io::Error::other("storage unavailable").into())
    }

    fn write(&self, _key: &str, _value: &str) -> flagpole::Result<()> {
        Err(std::io::Error::other("storage unavailable").into())
    }
}

/// Cache whose first write panics.
#[derive(Default)]
struct PanicOnFirstWrite {
    panicked: AtomicBool,
    inner: InMemoryCache,
}

impl ConfigCache for PanicOnFirstWrite {
    fn read(&self, key: &str) -> flagpole::Result<Option<String>> {
        self.inner.read(key)
    }

    fn write(&self, key: &str, value: &str) -> flagpole::Result<()> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("cache backend exploded");
        }
        self.inner.write(key, value)
    }
}

#[test]
fn fetched_configuration_is_written_to_cache() {
    init_logger();
    let server = MockServer::start();
    serve_config(&server, "\"v1\"");

    let cache = Arc::new(RecordingCache::default());
    let mut config = client_config(&server, PollingMode::manual());
    config.cache(cache.clone());
    let client = config.to_client().unwrap();
    assert!(client.force_refresh().is_success());

    let entry = cache.single_entry();
    let mut lines = entry.splitn(3, '\n');
    let fetched_at: i64 = lines.next().unwrap().parse().unwrap();
    assert!(fetched_at > 0);
    assert_eq!(lines.next(), Some("\"v1\""));
    assert!(lines.next().unwrap().contains("isFeatureEnabled"));

    // The SDK key itself is never persisted.
    let key = cache.entries.lock().unwrap().keys().next().unwrap().clone();
    assert!(!key.contains(common::SDK_KEY));
    client.close();
}

#[test]
fn second_client_adopts_cached_configuration() {
    init_logger();
    let server = MockServer::start();
    let mock = serve_config(&server, "\"v1\"");
    let cache = Arc::new(InMemoryCache::new());

    let mut config = client_config(&server, PollingMode::manual());
    config.cache(cache.clone());
    let first = config.to_client().unwrap();
    assert!(first.force_refresh().is_success());
    first.close();

    let ready = Recorder::default();
    let mut config = client_config(&server, PollingMode::manual());
    config.cache(cache);
    config.hooks().add_on_client_ready({
        let ready = ready.clone();
        move |state| ready.push(state)
    });
    let second = config.to_client().unwrap();

    let user = User::builder("bob").email("bob@example.com").build();
    assert!(second.get_value("isFeatureEnabled", Some(&user), false));
    assert_eq!(ready.values(), vec![ClientCacheState::HasCachedFlagDataOnly]);
    mock.assert_hits(1);
    second.close();
}

#[test]
fn fresh_cache_entry_satisfies_lazy_load() {
    init_logger();
    let server = MockServer::start();
    let mock = serve_config(&server, "\"v1\"");
    let cache = Arc::new(InMemoryCache::new());

    let mut config = client_config(&server, PollingMode::lazy_load(Duration::from_secs(60)));
    config.cache(cache.clone());
    let first = config.to_client().unwrap();
    assert!(!first.get_value("isFeatureEnabled", None, true));
    mock.assert_hits(1);

    let mut config = client_config(&server, PollingMode::lazy_load(Duration::from_secs(60)));
    config.cache(cache);
    let second = config.to_client().unwrap();
    assert!(!second.get_value("isFeatureEnabled", None, true));
    mock.assert_hits(1);

    first.close();
    second.close();
}

#[test]
fn file_cache_serves_offline_client() {
    init_logger();
    let dir = std::env::temp_dir().join(format!("flagpole-it-{}", std::process::id()));
    let server = MockServer::start();
    serve_config(&server, "\"v1\"");

    let mut config = client_config(&server, PollingMode::manual());
    config.cache(FileCache::new(&dir));
    let online = config.to_client().unwrap();
    assert!(online.force_refresh().is_success());
    online.close();

    let mut config = client_config(&server, PollingMode::manual());
    config.cache(FileCache::new(&dir)).offline(true);
    let offline = config.to_client().unwrap();
    assert_eq!(
        offline.get_value("discount", Some(&User::builder("u").country("Austria").build()), 0.0),
        25.0
    );
    offline.close();

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn cache_failures_are_reported_but_not_fatal() {
    init_logger();
    let server = MockServer::start();
    serve_config(&server, "\"v1\"");

    let errors = Recorder::default();
    let mut config = client_config(&server, PollingMode::manual());
    config.cache(BrokenCache);
    config.hooks().add_on_error({
        let errors = errors.clone();
        move |message, _err| errors.push(message.to_owned())
    });
    let client = config.to_client().unwrap();

    assert!(client.force_refresh().is_success());
    assert!(!client.get_value("isFeatureEnabled", None, true));
    assert!(errors
        .values()
        .iter()
        .any(|message| message.contains("writing the cache")));
    assert!(errors
        .values()
        .iter()
        .any(|message| message.contains("reading the cache")));
    client.close();
}

#[test]
fn panicking_cache_does_not_wedge_refreshes() {
    init_logger();
    let server = MockServer::start();
    let mock = serve_config(&server, "\"v1\"");

    let errors = Recorder::default();
    let cache = Arc::new(PanicOnFirstWrite::default());
    let mut config = client_config(&server, PollingMode::manual());
    config.cache(cache.clone());
    config.hooks().add_on_error({
        let errors = errors.clone();
        move |message, _err| errors.push(message.to_owned())
    });
    let client = config.to_client().unwrap();

    assert!(client.force_refresh().is_success());
    assert!(cache.panicked.load(Ordering::SeqCst));
    assert!(errors
        .values()
        .iter()
        .any(|message| message.contains("writing the cache")));
    mock.assert_hits(1);

    // Later refreshes reach the server again instead of joining a stale fetch.
    assert!(client.force_refresh().is_success());
    assert!(client.force_refresh().is_success());
    mock.assert_hits(3);
    assert!(!client.get_value("isFeatureEnabled", None, true));
    client.close();
}
