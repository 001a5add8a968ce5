// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Actions and Delivery Strategies
//!
//! Consumer actions handle the deliveries a listener routes to them. When an
//! action fails, or no action matches a delivery, the listener hands the
//! delivery to the configured failed or unhandled delivery strategy.

use crate::{delivery::Delivery, errors::BusError};
use async_trait::async_trait;
use std::{future::Future, sync::Arc};
use tracing::warn;

/// Handles deliveries routed to it by a listener.
#[async_trait]
pub trait ConsumerAction: Send + Sync {
    async fn consume(&self, delivery: Arc<Delivery>) -> Result<(), BusError>;
}

/// Adapter turning an async closure into a `ConsumerAction`.
pub struct FnConsumer<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerAction for FnConsumer<F>
where
    F: Fn(Arc<Delivery>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    async fn consume(&self, delivery: Arc<Delivery>) -> Result<(), BusError> {
        (self.f)(delivery).await
    }
}

/// Wraps an async closure as a consumer action.
pub fn consumer_fn<F, Fut>(f: F) -> Arc<dyn ConsumerAction>
where
    F: Fn(Arc<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    Arc::new(FnConsumer { f })
}

/// A delivery whose processing failed.
pub struct FailedDelivery {
    pub delivery: Arc<Delivery>,
    pub error: BusError,
}

#[async_trait]
pub trait FailedDeliveryStrategy: Send + Sync {
    async fn handle(&self, failed: FailedDelivery) -> Result<(), BusError>;
}

#[async_trait]
pub trait UnhandledDeliveryStrategy: Send + Sync {
    async fn handle(&self, delivery: Arc<Delivery>) -> Result<(), BusError>;
}

/// Rejects the delivery, dropping it (or dead-lettering it when the queue has
/// a DLQ) unless `requeue` is set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RejectDeliveryStrategy {
    requeue: bool,
}

impl RejectDeliveryStrategy {
    pub fn requeue() -> RejectDeliveryStrategy {
        RejectDeliveryStrategy { requeue: true }
    }
}

#[async_trait]
impl FailedDeliveryStrategy for RejectDeliveryStrategy {
    async fn handle(&self, failed: FailedDelivery) -> Result<(), BusError> {
        warn!(
            label = %failed.delivery.label(),
            error = failed.error.to_string(),
            requeue = self.requeue,
            "rejecting failed delivery"
        );
        failed.delivery.reject(self.requeue).await
    }
}

#[async_trait]
impl UnhandledDeliveryStrategy for RejectDeliveryStrategy {
    async fn handle(&self, delivery: Arc<Delivery>) -> Result<(), BusError> {
        warn!(label = %delivery.label(), requeue = self.requeue, "rejecting unhandled delivery");
        delivery.reject(self.requeue).await
    }
}
