//! Chat room client.
//!
//! Subscribes to `ChatChannel` for one room, says hello once the subscription is
//! confirmed and logs everything broadcast to the room.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info cargo run --example chat --features tracing -- ws://localhost:3000/cable
//! ```

use std::time::Duration;

use actioncable_client::cable::{Action, ActionTable, Channel, Consumer, SubscriptionEvent};
use actioncable_client::ws::config::{Config, ReconnectConfig};
use futures::StreamExt as _;
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info, warn};
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
        .reconnect(ReconnectConfig::builder().enabled(true).build())
        .headers(vec![("Origin".to_owned(), "http://localhost:3000".to_owned())])
        .build();
    let consumer = Consumer::new(&endpoint, config)?;

    let actions = ActionTable::new([Action::new("speak").param("message")])?;
    let channel = Channel::new("ChatChannel").with_param("room", "Best Room")?;
    let (subscription, events) = consumer.subscriptions().create_stream(channel);
    let mut events = Box::pin(events);

    info!(%endpoint, identifier = %subscription.identifier(), "Opening connection");
    consumer.open();

    while let Ok(Some(event)) = timeout(Duration::from_secs(60), events.next()).await {
        match event {
            SubscriptionEvent::Connected => {
                info!("Subscribed");
                let sent = actions.perform(&subscription, "speak", vec![json!("Hello!")])?;
                debug!(sent, "speak");
            }
            SubscriptionEvent::Received(message) => info!(%message, "Received"),
            SubscriptionEvent::Disconnected => warn!("Disconnected"),
            SubscriptionEvent::Rejected => warn!("Subscription rejected"),
            SubscriptionEvent::Failed(error) => warn!(%error, "Connection failed"),
            _ => {}
        }
    }

    consumer.close();
    Ok(())
}
