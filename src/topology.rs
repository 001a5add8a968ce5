// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology
//!
//! Collects the exchanges, queues and bindings a receiver depends on and
//! declares them on a channel before consumption starts. Exchanges are
//! declared first, then queues (with their retry and DLQ companions), then
//! bindings.

use crate::{
    channel::Channel,
    errors::BusError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Declares everything on `channel`.
    pub async fn install(&self, channel: &Channel) -> Result<(), BusError> {
        for def in &self.exchanges {
            channel.declare_exchange(def).await.map_err(|err| {
                error!(error = err.to_string(), name = def.name(), "error to declare the exchange");
                BusError::DeclareExchangeError(def.name().to_owned())
            })?;
        }

        for def in &self.queues {
            channel.declare_queue(def).await.map_err(|err| {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                BusError::DeclareQueueError(def.name().to_owned())
            })?;
        }

        for binding in &self.bindings {
            debug!(
                queue = %binding.queue_name,
                exchange = %binding.exchange_name,
                key = %binding.routing_key,
                "binding queue to exchange"
            );
            channel.bind_queue(binding).await.map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                BusError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })?;
        }

        Ok(())
    }
}
