use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::serde_helpers::decode_with_warnings;

/// Identifier of legacy heartbeat envelopes.
pub const PING_IDENTIFIER: &str = "_ping";

/// Inbound protocol frame.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Envelope {
    pub identifier: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<Value>,
    /// Reason given with a `disconnect` envelope
    pub reason: Option<String>,
    /// Whether the server allows reconnecting after a `disconnect` envelope
    pub reconnect: Option<bool>,
}

/// What an [`Envelope`] means for the client.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Server liveness beat
    Heartbeat,
    /// Server accepted the connection
    Welcome,
    /// Server is about to close the connection
    Disconnect {
        reason: Option<String>,
        reconnect: Option<bool>,
    },
    /// Subscriptions with `identifier` were accepted
    Confirmation { identifier: String },
    /// Subscriptions with `identifier` were refused
    Rejection { identifier: String },
    /// Data for subscriptions with `identifier`
    Broadcast { identifier: String, message: Value },
    /// No identifier to route by
    Unroutable,
}

impl Envelope {
    /// Decode an inbound text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        decode_with_warnings(text)
    }

    #[must_use]
    pub fn classify(self) -> Inbound {
        if self.identifier.as_deref() == Some(PING_IDENTIFIER) {
            return Inbound::Heartbeat;
        }

        match (self.kind.as_deref(), self.identifier) {
            (Some("ping"), _) => Inbound::Heartbeat,
            (Some("welcome"), _) => Inbound::Welcome,
            (Some("disconnect"), _) => Inbound::Disconnect {
                reason: self.reason,
                reconnect: self.reconnect,
            },
            (Some("confirm_subscription"), Some(identifier)) => {
                Inbound::Confirmation { identifier }
            }
            (Some("reject_subscription"), Some(identifier)) => Inbound::Rejection { identifier },
            (_, Some(identifier)) => Inbound::Broadcast {
                identifier,
                message: self.message.unwrap_or(Value::Null),
            },
            (_, None) => Inbound::Unroutable,
        }
    }
}
