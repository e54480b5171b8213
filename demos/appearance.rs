//! Presence client.
//!
//! Subscribes to `AppearanceChannel` with callbacks and reports the user as
//! appearing while connected. Shows the connection state as it changes.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug cargo run --example appearance --features tracing -- ws://localhost:3000/cable
//! ```

use std::time::Duration;

use actioncable_client::cable::{Channel, Consumer};
use actioncable_client::ws::config::{Config, ReconnectConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:3000/cable".to_owned());

    let config = Config::builder()
        .reconnect(
            ReconnectConfig::builder()
                .enabled(true)
                .max_attempts(10)
                .delay_max(Duration::from_secs(15))
                .build(),
        )
        .ping_interval(Duration::from_secs(20))
        .build();
    let consumer = Consumer::new(&endpoint, config)?;

    let subscription = consumer
        .subscriptions()
        .create(Channel::new("AppearanceChannel"));
    let handle = std::sync::Arc::downgrade(&subscription);
    subscription
        .on_connected(move || {
            if let Some(subscription) = handle.upgrade() {
                let sent = subscription.perform("appear");
                info!(sent, "Appeared");
            }
        })
        .on_received(|message| info!(%message, "Presence update"))
        .on_disconnected(|| warn!("Disconnected"))
        .on_failed(|error| warn!(%error, "Connection failed"));

    let mut states = consumer.state_receiver();
    consumer.open();

    let watch_states = async {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(%state, attempts = consumer.monitor().reconnect_attempts(), "Connection state");
        }
    };
    drop(tokio::time::timeout(Duration::from_secs(60), watch_states).await);

    subscription.perform("away");
    consumer.subscriptions().remove(&subscription);
    consumer.close();

    Ok(())
}
