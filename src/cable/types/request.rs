use serde::Serialize;
use serde_json::{Map, Value};

use crate::Result;

/// Outbound protocol command.
///
/// Serializes as `{"command": ..., "identifier": ...}`, with a `data` field for
/// [`Command::Message`]. `data` holds the action payload already encoded as a
/// JSON string, so the payload is encoded twice on the wire.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Subscribe { identifier: String },
    Unsubscribe { identifier: String },
    Message { identifier: String, data: String },
}

impl Command {
    #[must_use]
    pub fn subscribe<S: Into<String>>(identifier: S) -> Self {
        Self::Subscribe {
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub fn unsubscribe<S: Into<String>>(identifier: S) -> Self {
        Self::Unsubscribe {
            identifier: identifier.into(),
        }
    }

    /// Message command carrying `data` encoded as a string.
    #[must_use]
    pub fn message<S: Into<String>>(identifier: S, data: Map<String, Value>) -> Self {
        Self::Message {
            identifier: identifier.into(),
            data: Value::Object(data).to_string(),
        }
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        match self {
            Self::Subscribe { identifier }
            | Self::Unsubscribe { identifier }
            | Self::Message { identifier, .. } => identifier,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
