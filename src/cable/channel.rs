use std::sync::OnceLock;

use serde_json::{Map, Value};

use crate::Result;
use crate::error::Error;

const CHANNEL_KEY: &str = "channel";

/// Names a server-side channel plus the parameters that select one stream of it.
///
/// The [identifier](Self::identifier) is the JSON object `{"channel": name, ...params}`
/// with parameters in insertion order. Two channels with the same name and the
/// same parameters added in the same order share an identifier, and the server
/// multiplexes them onto one subscription.
///
/// # Example
///
/// ```
/// use actioncable_client::cable::Channel;
///
/// let channel = Channel::new("ChatChannel").with_param("room_id", 1)?;
///
/// assert_eq!(channel.identifier(), r#"{"channel":"ChatChannel","room_id":1}"#);
/// # Ok::<(), actioncable_client::error::Error>(())
/// ```
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Channel {
    params: Map<String, Value>,
    identifier: OnceLock<String>,
}

impl Channel {
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        let mut params = Map::new();
        params.insert(CHANNEL_KEY.to_owned(), Value::String(name.into()));

        Self {
            params,
            identifier: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.params
            .get(CHANNEL_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Add a parameter, replacing the value of an existing key in place.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `key` is `channel`.
    pub fn add_param<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) -> Result<()> {
        let key = key.into();
        if key == CHANNEL_KEY {
            return Err(Error::validation(format!(
                "the name '{CHANNEL_KEY}' is not allowed as a param key"
            )));
        }

        self.params.insert(key, value.into());
        self.identifier.take();
        Ok(())
    }

    /// Builder-style [`add_param`](Self::add_param).
    pub fn with_param<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Result<Self> {
        self.add_param(key, value)?;
        Ok(self)
    }

    /// Parameters including the channel name, in insertion order.
    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Canonical identifier, computed once and cached until a parameter changes.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.identifier
            .get_or_init(|| Value::Object(self.params.clone()).to_string())
    }
}
