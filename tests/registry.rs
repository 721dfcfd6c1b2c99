mod common;

use std::sync::Arc;

use flagpole::{Client, ClientConfig, ClientRegistry, PollingMode};

fn offline_config(sdk_key: &str) -> ClientConfig {
    let mut config = ClientConfig::from_sdk_key(sdk_key);
    config.polling_mode(PollingMode::manual()).offline(true);
    config
}

#[test]
fn global_registry_shares_instances() {
    common::init_logger();
    let registry = ClientRegistry::global();

    let created = registry
        .get_with_config(offline_config("registry-test-key"))
        .unwrap();
    let fetched = Client::get("registry-test-key").unwrap();
    assert!(Arc::ptr_eq(&created, &fetched));

    // An explicit configuration for an existing key is ignored.
    let mut other = ClientConfig::from_sdk_key("registry-test-key");
    other.polling_mode(PollingMode::manual());
    let again = registry.get_with_config(other).unwrap();
    assert!(Arc::ptr_eq(&created, &again));
    assert!(again.is_offline());

    fetched.close();
    assert!(created.is_closed());

    let recreated = registry
        .get_with_config(offline_config("registry-test-key"))
        .unwrap();
    assert!(!Arc::ptr_eq(&created, &recreated));

    let second = registry
        .get_with_config(offline_config("registry-test-key-2"))
        .unwrap();
    Client::close_all();
    assert!(recreated.is_closed());
    assert!(second.is_closed());
}

#[test]
fn invalid_configuration_is_not_registered() {
    let registry = ClientRegistry::new();
    assert!(registry.get_with_config(ClientConfig::from_sdk_key("")).is_err());
    assert!(registry.is_empty());
}
