//! Payload Codec
//!
//! Member payloads are JSON objects. While a registration is being
//! created the object carries one extra field, the handshake tag, which
//! decoding splits off again so application state never sees it.
//! Unknown fields are ignored on read, so payloads written by newer
//! members still decode on older ones.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Top-level field carrying the registration handshake tag
pub const HANDSHAKE_FIELD: &str = "uuid";

/// A decoded payload
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    /// Application state
    pub state: T,
    /// Handshake tag, present only on nodes written during registration
    pub handshake: Option<String>,
}

/// Serialize a state, optionally tagged with a handshake id
pub fn encode<T: Serialize>(state: &T, handshake: Option<&str>) -> Result<Vec<u8>> {
    let Some(tag) = handshake else {
        return Ok(serde_json::to_vec(state)?);
    };

    let mut value = serde_json::to_value(state)?;
    let object = value.as_object_mut().ok_or_else(|| {
        Error::InvalidPayload("node state must serialize to a JSON object".into())
    })?;
    object.insert(HANDSHAKE_FIELD.to_string(), Value::String(tag.to_string()));
    Ok(serde_json::to_vec(&value)?)
}

/// Deserialize a payload, separating the handshake tag from the state
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Decoded<T>> {
    let mut value: Value = serde_json::from_slice(bytes)?;
    let handshake = value
        .as_object_mut()
        .and_then(|object| object.remove(HANDSHAKE_FIELD))
        .and_then(|tag| tag.as_str().map(str::to_string));
    let state = serde_json::from_value(value)?;
    Ok(Decoded { state, handshake })
}
