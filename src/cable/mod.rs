//! Cable protocol client: channels, subscriptions and the consumer tying them to a connection.
//!
//! A single connection multiplexes any number of channel subscriptions. Each
//! subscription is named by an identifier derived from its [`Channel`]; the
//! server confirms or rejects it and then broadcasts data to it. Heartbeats
//! keep the [`ConnectionMonitor`](crate::ws::ConnectionMonitor) from reopening
//! the connection.
//!
//! # Example
//!
//! ```rust, no_run
//! use actioncable_client::cable::{Channel, Consumer, SubscriptionEvent};
//! use actioncable_client::ws::config::{Config, ReconnectConfig};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::builder()
//!         .reconnect(ReconnectConfig::builder().enabled(true).build())
//!         .build();
//!     let consumer = Consumer::new("ws://localhost:3000/cable", config)?;
//!
//!     let channel = Channel::new("ChatChannel").with_param("room_id", 1)?;
//!     let (subscription, events) = consumer.subscriptions().create_stream(channel);
//!     let mut events = Box::pin(events);
//!
//!     consumer.open();
//!
//!     while let Some(event) = events.next().await {
//!         match event {
//!             SubscriptionEvent::Connected => {
//!                 subscription.perform("appear");
//!             }
//!             SubscriptionEvent::Received(message) => println!("{message}"),
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod channel;
pub mod consumer;
pub mod subscription;
pub mod types;

pub use action::{Action, ActionTable};
pub use channel::Channel;
pub use consumer::Consumer;
pub use subscription::{Subscription, SubscriptionEvent, SubscriptionKey, Subscriptions};
pub use types::request::Command;
pub use types::response::{Envelope, Inbound};
