//! Serde helpers for inbound frames.
//!
//! When the `tracing` feature is enabled, fields the target type does not
//! capture are logged, and decoding failures are logged with the path at which
//! they occurred.

use serde::de::DeserializeOwned;

use crate::ws::WsError;

/// Decode a JSON text frame into `T`.
///
/// Unknown fields are reported at debug level but never fail decoding.
#[cfg(feature = "tracing")]
pub fn decode_with_warnings<T: DeserializeOwned>(text: &str) -> crate::Result<T> {
    use std::any::type_name;

    let mut unknown_paths: Vec<String> = Vec::new();

    let mut deserializer = serde_json::Deserializer::from_str(text);
    let result: serde_json::Result<T> = serde_ignored::deserialize(&mut deserializer, |path| {
        unknown_paths.push(path.to_string());
    })
    .and_then(|value| deserializer.end().map(|()| value));

    let value = result.map_err(|e| {
        let mut path_deserializer = serde_json::Deserializer::from_str(text);
        let path = serde_path_to_error::deserialize::<_, T>(&mut path_deserializer)
            .err()
            .map(|path_err| path_err.path().to_string())
            .unwrap_or_default();

        tracing::warn!(
            type_name = %type_name::<T>(),
            path = %path,
            error = %e,
            "failed to decode frame"
        );
        WsError::MessageParse(e)
    })?;

    for path in unknown_paths {
        tracing::debug!(type_name = %type_name::<T>(), field = %path, "unknown field in frame");
    }

    Ok(value)
}

/// Plain decoding when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn decode_with_warnings<T: DeserializeOwned>(text: &str) -> crate::Result<T> {
    Ok(serde_json::from_str(text).map_err(WsError::MessageParse)?)
}
