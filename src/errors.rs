// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Bus Runtime
//!
//! This module provides the error type shared by every component of the bus:
//! connection pooling, channels, confirmation tracking, producers and listeners.
//! `BusError` is `Clone` because a single failure is frequently delivered to
//! several waiters of one shared future (e.g. concurrent `expect` callers).

use thiserror::Error;

/// Represents errors that can occur while running the bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect to `{0}`")]
    ConnectionError(String),

    /// A channel was requested from a connection that is not open
    #[error("connection `{0}` is not open")]
    ConnectionNotOpen(String),

    /// The broker connection was shut down underneath its users
    #[error("connection shut down: {0}")]
    ConnectionShutdown(String),

    /// Error creating or using a channel
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// The channel was closed while an operation was in flight
    #[error("channel shut down: {0}")]
    ChannelShutdown(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer against a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively acknowledged a published message
    #[error("message `{0}` was rejected by the broker")]
    Rejected(u64),

    /// The channel went away before the broker confirmed the message
    #[error("message `{seq_no}` is unconfirmed: {reason}")]
    Unconfirmed { seq_no: u64, reason: String },

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error encoding a payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error decoding a payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// A payload failed validation before reaching its consumer
    #[error("message `{label}` is invalid: {reason}")]
    ValidationError { label: String, reason: String },

    /// A consumer action failed
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The broker cancelled a consumer, or its delivery stream ended
    #[error("consumer `{0}` was cancelled")]
    ConsumerCancelled(String),

    /// A consumer for the label is already registered on the listener
    #[error("consumer for label `{0}` is already registered")]
    DuplicateConsumer(String),

    /// A response was not received in time
    #[error("request `{0}` timed out")]
    Timeout(String),

    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// The listener is not consuming, so it cannot track expectations
    #[error("listener on `{0}` is not consuming")]
    NotConsuming(String),

    /// Two receivers share one queue with conflicting options
    #[error("listener on `{queue}` is incompatible: option `{option}` differs")]
    IncompatibleListener { queue: String, option: String },

    /// A producer was given a second callback listener
    #[error("producer for `{0}` already has a callback listener")]
    CallbackListenerAlreadySet(String),

    /// A request was issued by a producer without a callback listener
    #[error("producer for `{0}` has no callback listener")]
    NoCallbackListener(String),

    /// A delivery could not be replied to because it carries no reply route
    #[error("delivery has no reply route")]
    MissingReplyRoute,

    /// A selector was asked for a producer while holding none
    #[error("no producers available")]
    NoProducers,

    /// Every attempt of a fault tolerant send failed
    #[error("failed after {attempts} attempts")]
    AttemptsExhausted {
        attempts: usize,
        errors: Vec<BusError>,
    },

    /// No sender is configured for the label
    #[error("no route for label `{0}`")]
    NoRoute(String),

    /// The bus is not in a state that allows the operation
    #[error("bus is `{0}`")]
    InvalidState(String),

    /// Invalid bus or endpoint configuration
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

impl BusError {
    /// Returns true when the error signals that a connection or channel
    /// underneath the operation is gone, i.e. a retry on another producer may succeed.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            BusError::ConnectionError(_)
                | BusError::ConnectionNotOpen(_)
                | BusError::ConnectionShutdown(_)
                | BusError::ChannelError(_)
                | BusError::ChannelShutdown(_)
                | BusError::Unconfirmed { .. }
        )
    }
}
