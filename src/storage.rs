// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Header Storage
//!
//! Listeners store the headers of every delivery they dispatch; producers load
//! them and carry them forward on the messages they send, so breadcrumbs and
//! the original message id follow a conversation across services.

use crate::message::{Headers, HEADER_BREADCRUMBS, HEADER_ORIGINAL_MESSAGE_ID};
use parking_lot::Mutex;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait HeaderStorage: Send + Sync {
    fn store(&self, headers: &Headers);

    fn load(&self) -> Headers;
}

/// Forgets everything it is given.
#[derive(Debug, Default, Clone)]
pub struct NullHeaderStorage;

impl HeaderStorage for NullHeaderStorage {
    fn store(&self, _headers: &Headers) {}

    fn load(&self) -> Headers {
        Headers::default()
    }
}

/// Keeps the headers of interest of the last stored delivery.
pub struct InMemoryHeaderStorage {
    keys: Vec<String>,
    stored: Mutex<Headers>,
}

impl Default for InMemoryHeaderStorage {
    fn default() -> Self {
        InMemoryHeaderStorage::with_keys(&[HEADER_BREADCRUMBS, HEADER_ORIGINAL_MESSAGE_ID])
    }
}

impl InMemoryHeaderStorage {
    pub fn new() -> InMemoryHeaderStorage {
        InMemoryHeaderStorage::default()
    }

    pub fn with_keys(keys: &[&str]) -> InMemoryHeaderStorage {
        InMemoryHeaderStorage {
            keys: keys.iter().map(|k| (*k).to_owned()).collect(),
            stored: Mutex::new(Headers::default()),
        }
    }
}

impl HeaderStorage for InMemoryHeaderStorage {
    fn store(&self, headers: &Headers) {
        let kept: Headers = headers
            .iter()
            .filter(|(key, _)| self.keys.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        *self.stored.lock() = kept;
    }

    fn load(&self) -> Headers {
        self.stored.lock().clone()
    }
}
