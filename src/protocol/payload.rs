//! Application payload framing
//!
//! Payloads cross the data channel as JSON text frames, so both ends only
//! need to agree on the JSON shape of their messages.

use serde::Serialize;
use serde_json::Value;

use crate::network::NetworkError;

/// Encode an application payload into a text frame
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<String, NetworkError> {
    Ok(serde_json::to_string(payload)?)
}

/// Decode a received text frame
pub fn decode(frame: &str) -> Result<Value, NetworkError> {
    serde_json::from_str(frame).map_err(|e| NetworkError::MalformedPayload(e.to_string()))
}
