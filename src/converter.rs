// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Converters
//!
//! Converters turn message payloads into bytes on the way out and back into
//! values on the way in. Choosing a converter per content type is left to the
//! application; the bus ships a JSON converter.

use crate::errors::BusError;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Serializes and deserializes payloads for one content type.
pub trait PayloadConverter: Send + Sync {
    fn content_type(&self) -> &str;

    fn from_object(&self, payload: &serde_json::Value) -> Result<Vec<u8>, BusError>;

    fn to_object(&self, bytes: &[u8]) -> Result<serde_json::Value, BusError>;
}

#[derive(Debug, Default, Clone)]
pub struct JsonPayloadConverter;

impl PayloadConverter for JsonPayloadConverter {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn from_object(&self, payload: &serde_json::Value) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(payload).map_err(|err| BusError::SerializePayloadError(err.to_string()))
    }

    fn to_object(&self, bytes: &[u8]) -> Result<serde_json::Value, BusError> {
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|err| BusError::ParsePayloadError(err.to_string()))
    }
}
