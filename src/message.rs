// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Headers
//!
//! Outgoing messages carry a label, a header map and a payload. The payload is
//! kept as a `serde_json::Value` and turned into bytes by a `PayloadConverter`
//! right before it hits a channel.

use crate::label::MessageLabel;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Header carrying the correlation id of a request/response pair
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
/// Header carrying the route a response must be published to
pub const HEADER_REPLY_ROUTE: &str = "x-reply-route";
/// Header carrying the list of services a message passed through
pub const HEADER_BREADCRUMBS: &str = "x-breadcrumbs";
/// Header carrying the id of the message that started a conversation
pub const HEADER_ORIGINAL_MESSAGE_ID: &str = "x-original-message-id";
/// Header carrying the request timeout in milliseconds
pub const HEADER_TIMEOUT: &str = "x-timeout";
/// Header carrying the message time-to-live in milliseconds
pub const HEADER_TTL: &str = "x-ttl";
/// Header flagging a message as persistent
pub const HEADER_PERSIST: &str = "x-persist";
/// Header carrying the label of a message
pub const HEADER_MESSAGE_LABEL: &str = "x-message-label";

/// A single header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<HeaderValue>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Integers are returned as is, numeric strings are parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Str(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(v) => Some(*v),
            HeaderValue::Str(v) => v.parse().ok(),
            HeaderValue::Int(v) => Some(*v != 0),
            HeaderValue::List(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Message headers keyed by name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// An outgoing (or decoded incoming) message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub label: MessageLabel,
    pub headers: Headers,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(label: MessageLabel, payload: serde_json::Value) -> Message {
        Message {
            label,
            headers: Headers::default(),
            payload,
        }
    }

    /// Builds a message from any serializable payload.
    pub fn from_payload<T: Serialize>(
        label: MessageLabel,
        payload: &T,
    ) -> Result<Message, crate::errors::BusError> {
        let value = serde_json::to_value(payload)
            .map_err(|err| crate::errors::BusError::SerializePayloadError(err.to_string()))?;
        Ok(Message::new(label, value))
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Decodes the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::errors::BusError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|err| crate::errors::BusError::ParsePayloadError(err.to_string()))
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(HEADER_CORRELATION_ID).and_then(HeaderValue::as_str)
    }

    pub fn timeout(&self) -> Option<Duration> {
        millis_header(&self.headers, HEADER_TIMEOUT)
    }

    pub fn ttl(&self) -> Option<Duration> {
        millis_header(&self.headers, HEADER_TTL)
    }

    pub fn persist(&self) -> bool {
        self.header(HEADER_PERSIST)
            .and_then(HeaderValue::as_bool)
            .unwrap_or(false)
    }

    pub fn breadcrumbs(&self) -> Vec<String> {
        match self.header(HEADER_BREADCRUMBS) {
            Some(HeaderValue::List(items)) => items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_owned))
                .collect(),
            Some(HeaderValue::Str(v)) => v.split(';').map(str::to_owned).collect(),
            _ => vec![],
        }
    }
}

pub(crate) fn millis_header(headers: &Headers, key: &str) -> Option<Duration> {
    headers
        .get(key)
        .and_then(HeaderValue::as_i64)
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_well_known_headers() {
        let msg = Message::new(MessageLabel::new("boo"), json!({}))
            .with_header(HEADER_CORRELATION_ID, "abc")
            .with_header(HEADER_TIMEOUT, 150_i64)
            .with_header(HEADER_TTL, "2000")
            .with_header(HEADER_PERSIST, true);

        assert_eq!(msg.correlation_id(), Some("abc"));
        assert_eq!(msg.timeout(), Some(Duration::from_millis(150)));
        assert_eq!(msg.ttl(), Some(Duration::from_secs(2)));
        assert!(msg.persist());
    }

    #[test]
    fn zero_timeout_means_no_timeout() {
        let msg =
            Message::new(MessageLabel::new("boo"), json!(null)).with_header(HEADER_TIMEOUT, 0_i64);
        assert_eq!(msg.timeout(), None);
    }

    #[test]
    fn breadcrumbs_accept_lists_and_strings() {
        let listed = Message::new(MessageLabel::new("a"), json!(null)).with_header(
            HEADER_BREADCRUMBS,
            HeaderValue::List(vec!["svc-a".into(), "svc-b".into()]),
        );
        let joined = Message::new(MessageLabel::new("a"), json!(null))
            .with_header(HEADER_BREADCRUMBS, "svc-a;svc-b");

        assert_eq!(listed.breadcrumbs(), vec!["svc-a", "svc-b"]);
        assert_eq!(joined.breadcrumbs(), listed.breadcrumbs());
    }

    #[test]
    fn payload_round_trips_through_typed_values() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Boo {
            num: i32,
        }

        let msg = Message::from_payload(MessageLabel::new("boo"), &Boo { num: 13 }).unwrap();
        assert_eq!(msg.payload_as::<Boo>().unwrap(), Boo { num: 13 });
    }
}
