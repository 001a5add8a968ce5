// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The bus talks to the broker only through the traits in this module. The
//! `amqp` implementation is backed by `lapin`; the `memory` implementation is an
//! in-process broker used by tests and by applications that want to exercise
//! their consumers without a running broker.
//!
//! Native handles are not assumed to be thread safe: the `Channel` wrapper
//! serializes every call made on a `NativeChannel`.

use crate::{
    errors::BusError,
    exchange::ExchangeDefinition,
    message::Headers,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(test)]
use mockall::automock;

pub mod amqp;
pub mod memory;

/// Invoked with a reason text when a native connection or channel is closed by the broker.
pub type ShutdownHandler = Box<dyn Fn(String) + Send + Sync>;

/// Invoked with `(confirmed, seq_no, multiple)` for every publisher confirm.
pub type ConfirmationHandler = Arc<dyn Fn(bool, u64, bool) + Send + Sync>;

/// Deliveries pushed by the broker to one consumer tag.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<NativeDelivery>;

/// Transport level message properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub timestamp: Option<u64>,
    pub expiration: Option<String>,
    pub delivery_mode: Option<u8>,
    pub headers: Headers,
}

/// A message as handed over by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: NativeProperties,
    pub body: Vec<u8>,
}

/// Opens native broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn NativeConnection>, BusError>;
}

/// A live native connection.
#[async_trait]
pub trait NativeConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn NativeChannel>, BusError>;

    /// Graceful close.
    async fn close(&self) -> Result<(), BusError>;

    /// Drops the connection without the close handshake.
    fn abort(&self);

    /// Registers a handler fired when the broker, not the client, ends the connection.
    fn on_shutdown(&self, handler: ShutdownHandler);
}

/// A native session multiplexed on a connection.
#[async_trait]
pub trait NativeChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BusError>;

    async fn confirm_select(&self) -> Result<(), BusError>;

    /// Sequence number the next publish will get, `0` when confirms are off.
    fn next_publish_seq_no(&self) -> u64;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: NativeProperties,
    ) -> Result<(), BusError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BusError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryReceiver, BusError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BusError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BusError>;

    /// Declares `name` with the flags of `def`; returns the effective queue name.
    async fn queue_declare(
        &self,
        name: &str,
        def: &QueueDefinition,
        arguments: Headers,
    ) -> Result<String, BusError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;

    /// Registers a handler fired when the broker closes the channel.
    fn on_shutdown(&self, handler: ShutdownHandler);

    fn on_confirmation(&self, handler: ConfirmationHandler);
}
