#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use tokio_tungstenite::tungstenite;

use crate::error::{Error, Kind};

/// Transport-level failures.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Handshake failure, abnormal close or I/O error on the socket
    Connection(tungstenite::Error),
    /// An inbound text frame could not be decoded
    MessageParse(serde_json::Error),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
        }
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(Kind::WebSocket, e)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::with_source(Kind::WebSocket, WsError::Connection(e))
    }
}
