//! Core WebSocket infrastructure.
//!
//! # Architecture
//!
//! - [`Connection`]: one logical socket with a serialized lifecycle state machine
//! - [`ConnectionMonitor`]: heartbeat staleness detection with bounded, backed-off reopening
//! - [`ConnectionListener`], [`Transmit`], [`Reconnect`]: seams to the protocol layer
//!
//! The protocol layer in [`crate::cable`] is built on top of these pieces.

pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod traits;

pub use connection::{Connection, ConnectionState};
pub use monitor::ConnectionMonitor;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
