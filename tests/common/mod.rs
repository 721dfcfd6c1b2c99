#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use flagpole::{Client, ClientConfig, PollingMode};
use httpmock::prelude::*;

pub const SDK_KEY: &str = "integration-test-key";
pub const CONFIG_PATH: &str = "/configuration-files/integration-test-key/config_v5.json";

pub fn sample_config() -> &'static str {
    include_str!("../data/config/sample_v5.json")
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Configuration pointing at `server` with the given polling mode.
pub fn client_config(server: &MockServer, polling_mode: PollingMode) -> ClientConfig {
    let mut config = ClientConfig::from_sdk_key(SDK_KEY);
    config
        .polling_mode(polling_mode)
        .base_url(server.base_url())
        .request_timeout(Duration::from_secs(5));
    config
}

pub fn client(server: &MockServer, polling_mode: PollingMode) -> Client {
    client_config(server, polling_mode).to_client().unwrap()
}

/// Serve the sample configuration with the given ETag.
pub fn serve_config<'a>(server: &'a MockServer, etag: &str) -> httpmock::Mock<'a> {
    server.mock(|when, then| {
        when.method(GET).path(CONFIG_PATH);
        then.status(200)
            .header("ETag", etag)
            .header("content-type", "application/json")
            .body(sample_config());
    })
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    condition()
}

/// Collects values pushed from hooks.
#[derive(Clone)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Recorder(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn values(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
