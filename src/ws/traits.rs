//! Seams between the connection, its observers and the subscription layer.

use crate::error::Error;

/// Receives transport events for one [`Connection`](super::Connection).
///
/// Every callback runs on the connection's worker task, one at a time and in
/// the order the events occurred. Callbacks must not block; calling back into
/// the connection is allowed and is queued behind the current event.
pub trait ConnectionListener: Send + Sync + 'static {
    /// The WebSocket handshake completed and the connection is open.
    fn on_open(&self);

    /// A text frame arrived.
    fn on_message(&self, text: &str);

    /// The server started the close handshake.
    fn on_closing(&self) {}

    /// The close handshake completed.
    fn on_closed(&self);

    /// The transport failed, or an operation was attempted in the wrong state.
    fn on_failure(&self, error: Error);
}

/// Hands outbound text to an open connection.
///
/// Returns `true` only if the text was accepted for delivery. Nothing is
/// queued when the connection is not open; retrying is up to the caller.
pub trait Transmit: Send + Sync + 'static {
    fn transmit(&self, text: String) -> bool;
}

/// Something the connection monitor can ask to reconnect.
pub trait Reconnect: Send + Sync + 'static {
    fn reopen(&self);
}
