// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Rabbit Bus
//!
//! A messaging bus client over an AMQP broker: pooled connections, confirmed
//! publishing, fault tolerant producers spread over several brokers, parallel
//! listeners with label based dispatch, and request/response correlation.

mod otel;

pub mod bus;
pub mod channel;
pub mod config;
pub mod confirmation;
pub mod connection;
pub mod converter;
pub mod delivery;
pub mod errors;
pub mod exchange;
pub mod expectation;
pub mod fault_tolerant;
pub mod label;
pub mod listener;
pub mod message;
pub mod pool;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod route;
pub mod selector;
pub mod storage;
pub mod strategy;
pub mod ticket_timer;
pub mod topology;
pub mod transport;
pub mod validation;

pub use bus::{Bus, BusConfiguration, BusState, ReceiverConfiguration, SenderConfiguration};
pub use config::{BusSettings, ReceiverOptions, RetryPolicy, SenderOptions};
pub use delivery::Delivery;
pub use errors::BusError;
pub use label::MessageLabel;
pub use message::{HeaderValue, Headers, Message};
pub use strategy::{consumer_fn, ConsumerAction};
