// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Validation
//!
//! Validators check a decoded payload before it reaches its consumer. A
//! failing validation is a dispatch failure and goes to the failed delivery
//! strategy.

use crate::{errors::BusError, label::MessageLabel};
use std::{collections::HashMap, sync::Arc};

pub trait MessageValidator: Send + Sync {
    fn validate(&self, payload: &serde_json::Value) -> Result<(), String>;
}

impl<F> MessageValidator for F
where
    F: Fn(&serde_json::Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, payload: &serde_json::Value) -> Result<(), String> {
        self(payload)
    }
}

/// Validators keyed by the label they check.
#[derive(Default, Clone)]
pub struct ValidatorRegistry {
    validators: HashMap<MessageLabel, Arc<dyn MessageValidator>>,
}

impl ValidatorRegistry {
    pub fn new() -> ValidatorRegistry {
        ValidatorRegistry::default()
    }

    pub fn register(mut self, label: MessageLabel, validator: Arc<dyn MessageValidator>) -> Self {
        self.validators.insert(label, validator);
        self
    }

    pub fn has_validator(&self, label: &MessageLabel) -> bool {
        self.validators.contains_key(label)
    }

    /// Validates `payload` against the validator of `label`; labels without one pass.
    pub fn validate(
        &self,
        label: &MessageLabel,
        payload: &serde_json::Value,
    ) -> Result<(), BusError> {
        match self.validators.get(label) {
            Some(validator) => {
                validator
                    .validate(payload)
                    .map_err(|reason| BusError::ValidationError {
                        label: label.to_string(),
                        reason,
                    })
            }
            None => Ok(()),
        }
    }
}
