//! JSON-value buffer codec.
//!
//! Payload frames carry structured data as UTF-8 encoded JSON. This module
//! is the single place where values cross the byte boundary so that both
//! framers agree on the encoding.

use crate::error::{ProtoError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Encode a serializable value into a UTF-8 JSON buffer.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ProtoError::Pack(format!("value encode failed: {}", e)))
}

/// Decode a UTF-8 JSON buffer into a typed value.
pub fn decode_value<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    serde_json::from_slice(buf).map_err(|e| ProtoError::Unpack(format!("value decode failed: {}", e)))
}

/// Decode a buffer into a dynamic JSON value.
pub fn decode_json(buf: &[u8]) -> Result<Value> {
    decode_value(buf)
}
