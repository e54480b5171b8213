use std::sync::{Arc, Weak};

use tokio::sync::watch;
use url::Url;

use super::subscription::Subscriptions;
use super::types::request::Command;
use super::types::response::{Envelope, Inbound};
use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::{Connection, ConnectionListener, ConnectionMonitor, ConnectionState};

/// Client for one cable endpoint.
///
/// Owns a [`Connection`], the [`ConnectionMonitor`] watching it and the
/// [`Subscriptions`] multiplexed over it. Subscriptions are sent again every
/// time the connection opens. Dropping the last handle closes the connection.
///
/// # Example
///
/// ```rust, no_run
/// use actioncable_client::cable::{Channel, Consumer};
/// use actioncable_client::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let consumer = Consumer::new("ws://localhost:3000/cable", Config::default())?;
///
///     let channel = Channel::new("ChatChannel").with_param("room_id", 1)?;
///     consumer
///         .subscriptions()
///         .create(channel)
///         .on_received(|message| println!("{message}"));
///
///     consumer.open();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    /// Endpoint the connection targets
    endpoint: Url,
    connection: Connection,
    monitor: Arc<ConnectionMonitor<Connection>>,
    subscriptions: Arc<Subscriptions>,
}

impl Consumer {
    /// Create a consumer for a `ws://` or `wss://` endpoint.
    ///
    /// The connection stays closed until [`open`](Self::open). Must be called
    /// within a Tokio runtime.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported endpoint scheme '{}', expected ws or wss",
                endpoint.scheme()
            )));
        }

        let reconnect = config.reconnect.clone();
        let connection = Connection::new(endpoint.clone(), config)?;
        let monitor = Arc::new(ConnectionMonitor::new(connection.clone(), reconnect)?);
        let subscriptions = Arc::new(Subscriptions::new(Arc::new(connection.clone())));

        connection.set_listener(Arc::new(Dispatcher {
            monitor: Arc::downgrade(&monitor),
            subscriptions: Arc::downgrade(&subscriptions),
        }));

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                endpoint,
                connection,
                monitor,
                subscriptions,
            }),
        })
    }

    /// Open the connection and start monitoring it.
    pub fn open(&self) {
        self.inner.connection.open();
        self.inner.monitor.start();
    }

    /// Stop monitoring and close the connection. Subscriptions stay registered.
    pub fn close(&self) {
        self.inner.connection.close();
        self.inner.monitor.stop();
    }

    /// Send a raw command. Returns `false` if the connection is not open.
    pub fn send(&self, command: &Command) -> bool {
        match command.to_json() {
            Ok(text) => self.inner.connection.send(text),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to encode command");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                false
            }
        }
    }

    #[must_use]
    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        &self.inner.subscriptions
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<ConnectionMonitor<Connection>> {
        &self.inner.monitor
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        self.monitor.stop();
        self.connection.close();
    }
}

/// Routes connection events to the monitor and the subscription registry.
struct Dispatcher {
    monitor: Weak<ConnectionMonitor<Connection>>,
    subscriptions: Weak<Subscriptions>,
}

impl ConnectionListener for Dispatcher {
    fn on_open(&self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.connected();
        }
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            subscriptions.reload();
        }
    }

    fn on_message(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, frame = %text, "Dropping undecodable frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        match envelope.classify() {
            Inbound::Heartbeat => {
                if let Some(monitor) = self.monitor.upgrade() {
                    monitor.ping_received();
                }
            }
            Inbound::Welcome => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Server welcomed connection");
            }
            Inbound::Disconnect { reason, reconnect } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(?reason, ?reconnect, "Server announced disconnect");
                #[cfg(not(feature = "tracing"))]
                let _ = (&reason, &reconnect);
            }
            Inbound::Confirmation { identifier } => {
                if let Some(subscriptions) = self.subscriptions.upgrade() {
                    subscriptions.notify_connected(&identifier);
                }
            }
            Inbound::Rejection { identifier } => {
                if let Some(subscriptions) = self.subscriptions.upgrade() {
                    subscriptions.reject(&identifier);
                }
            }
            Inbound::Broadcast {
                identifier,
                message,
            } => {
                if let Some(subscriptions) = self.subscriptions.upgrade() {
                    subscriptions.notify_received(&identifier, &message);
                }
            }
            Inbound::Unroutable => {
                #[cfg(feature = "tracing")]
                tracing::warn!(frame = %text, "Dropping frame without identifier");
            }
        }
    }

    fn on_closed(&self) {
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            subscriptions.notify_disconnected();
        }
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.disconnected();
        }
    }

    fn on_failure(&self, error: Error) {
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            subscriptions.notify_failed(error);
        }
    }
}
