// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Labels
//!
//! A label names a logical message type. Labels decouple what a message is from
//! where it is physically routed; the route resolver maps one to the other.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, sync::Arc};

const ANY_LABEL: &str = "*";

/// Identifies a logical message type. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageLabel(Arc<str>);

impl MessageLabel {
    pub fn new(name: &str) -> MessageLabel {
        MessageLabel(Arc::from(name))
    }

    /// Wildcard label. A consumer registered under it handles any label.
    pub fn any() -> MessageLabel {
        MessageLabel::new(ANY_LABEL)
    }

    /// Label of a message that carries no label at all.
    pub fn empty() -> MessageLabel {
        MessageLabel::new("")
    }

    pub fn is_any(&self) -> bool {
        &*self.0 == ANY_LABEL
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for MessageLabel {
    fn default() -> Self {
        MessageLabel::empty()
    }
}

impl fmt::Display for MessageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageLabel {
    fn from(value: &str) -> Self {
        MessageLabel::new(value)
    }
}

impl From<String> for MessageLabel {
    fn from(value: String) -> Self {
        MessageLabel(Arc::from(value))
    }
}

impl Serialize for MessageLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(MessageLabel::from)
    }
}
