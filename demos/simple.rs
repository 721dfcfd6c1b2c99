use std::time::Duration;

use flagpole::{ClientConfig, LogLevel, PollingMode, User};

pub fn main() -> flagpole::Result<()> {
    // Configure env_logger to see client logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("flagpole")).init();

    let sdk_key =
        std::env::var("FLAGPOLE_SDK_KEY").expect("FLAGPOLE_SDK_KEY env variable should contain SDK key");

    let mut config = ClientConfig::from_sdk_key(sdk_key);
    config
        .polling_mode(
            PollingMode::auto_poll(Duration::from_secs(30))
                .with_max_init_wait(Duration::from_secs(3))
                .with_on_refresh(|result| println!("refreshed: {}", result.is_success())),
        )
        .log_level(LogLevel::Info);
    config
        .hooks()
        .add_on_client_ready(|state| println!("client ready: {state:?}"))
        .add_on_error(|message, err| eprintln!("error: {message} ({err:?})"));

    let client = config.to_client()?;

    let user = User::builder("user-42")
        .email("someone@example.com")
        .country("Hungary")
        .build();

    // Blocks until the first fetch completes or max_init_wait elapses.
    let details = client.get_value_details("isFeatureEnabled", Some(&user), false);
    println!(
        "isFeatureEnabled: {} (variation: {:?}, default: {})",
        details.value, details.variation_id, details.is_default_value
    );

    for (key, value) in client.get_all_values(Some(&user)) {
        println!("{key} = {value}");
    }

    client.close();
    Ok(())
}
