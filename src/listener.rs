// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener
//!
//! A listener consumes one queue on one broker. Starting it spawns as many
//! worker tasks as the configured parallelism level; each worker opens its
//! own channel on the listener's connection and consumes under its own
//! consumer tag. Every delivery is dispatched in this order:
//!
//! 1. a response to a pending expectation completes it,
//! 2. a consumer registered for the exact label handles it,
//! 3. a consumer registered for the wildcard label handles it,
//! 4. when exactly one consumer is registered, that consumer handles it,
//! 5. otherwise the unhandled delivery strategy gets it.
//!
//! Dispatch errors and consumer panics go to the failed delivery strategy and
//! never end a worker.
//! A worker that loses its channel or consumer raises the `failed` event; the
//! event fires once per consumption run no matter how many workers fail.
//!
//! Callback listeners consume from an exclusive, auto-deleted, broker-named
//! queue declared when consumption starts.

use crate::{
    channel::Channel,
    config::ReceiverOptions,
    connection::Connection,
    converter::{JsonPayloadConverter, PayloadConverter},
    delivery::Delivery,
    errors::BusError,
    expectation::{Expectation, ResponseFuture},
    label::MessageLabel,
    otel,
    pool::ConnectionPool,
    queue::QueueDefinition,
    route::Route,
    storage::{HeaderStorage, NullHeaderStorage},
    strategy::{
        ConsumerAction, FailedDelivery, FailedDeliveryStrategy, RejectDeliveryStrategy,
        UnhandledDeliveryStrategy,
    },
    ticket_timer::TicketTimer,
    topology::Topology,
    validation::ValidatorRegistry,
};
use futures_util::{future::join_all, FutureExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    borrow::Cow,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

type FailedHandler = Arc<dyn Fn(&BusError) + Send + Sync>;
type Expectations = Arc<Mutex<HashMap<String, Arc<Expectation>>>>;

/// Where a listener consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListeningSource {
    Queue(String),
    /// A broker-named response queue owned by the listener.
    Callback,
}

/// Collaborators a listener dispatches deliveries through.
#[derive(Clone)]
pub struct DeliveryHandling {
    pub converter: Arc<dyn PayloadConverter>,
    pub failed: Arc<dyn FailedDeliveryStrategy>,
    pub unhandled: Arc<dyn UnhandledDeliveryStrategy>,
    pub header_storage: Arc<dyn HeaderStorage>,
    pub validators: Arc<ValidatorRegistry>,
}

impl Default for DeliveryHandling {
    fn default() -> Self {
        DeliveryHandling {
            converter: Arc::new(JsonPayloadConverter),
            failed: Arc::new(RejectDeliveryStrategy::default()),
            unhandled: Arc::new(RejectDeliveryStrategy::default()),
            header_storage: Arc::new(NullHeaderStorage),
            validators: Arc::new(ValidatorRegistry::new()),
        }
    }
}

struct Running {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    timer: Arc<TicketTimer>,
    connection: Arc<Connection>,
}

pub struct Listener {
    url: String,
    source: ListeningSource,
    options: ReceiverOptions,
    handling: DeliveryHandling,
    pool: Arc<ConnectionPool>,
    timer_resolution: Duration,
    topology: Mutex<Topology>,
    consumers: RwLock<HashMap<MessageLabel, Arc<dyn ConsumerAction>>>,
    expectations: Expectations,
    state: tokio::sync::Mutex<Option<Running>>,
    token: Mutex<Option<CancellationToken>>,
    timer: RwLock<Option<Arc<TicketTimer>>>,
    queue_name: RwLock<Option<String>>,
    failed: AtomicBool,
    failed_handlers: Mutex<Vec<FailedHandler>>,
}

impl Listener {
    pub fn new(
        pool: Arc<ConnectionPool>,
        url: &str,
        source: ListeningSource,
        options: ReceiverOptions,
        handling: DeliveryHandling,
        timer_resolution: Duration,
    ) -> Arc<Listener> {
        Arc::new(Listener {
            url: url.to_owned(),
            source,
            options,
            handling,
            pool,
            timer_resolution,
            topology: Mutex::new(Topology::default()),
            consumers: RwLock::new(HashMap::default()),
            expectations: Arc::default(),
            state: tokio::sync::Mutex::new(None),
            token: Mutex::new(None),
            timer: RwLock::new(None),
            queue_name: RwLock::new(None),
            failed: AtomicBool::new(false),
            failed_handlers: Mutex::new(vec![]),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source(&self) -> &ListeningSource {
        &self.source
    }

    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    pub fn is_callback(&self) -> bool {
        self.source == ListeningSource::Callback
    }

    /// Adds declarations installed before consumption starts.
    pub fn extend_topology(&self, topology: Topology) {
        let mut current = self.topology.lock();
        current.exchanges.extend(topology.exchanges);
        current.queues.extend(topology.queues);
        current.bindings.extend(topology.bindings);
    }

    /// Registers `action` for `label`. A label keeps the action it was first
    /// registered with.
    pub fn register_consumer(
        &self,
        label: MessageLabel,
        action: Arc<dyn ConsumerAction>,
    ) -> Result<(), BusError> {
        let mut consumers = self.consumers.write();
        if consumers.contains_key(&label) {
            return Err(BusError::DuplicateConsumer(label.to_string()));
        }
        consumers.insert(label, action);
        Ok(())
    }

    /// Registers `action` for `label`, replacing any action already registered.
    pub fn replace_consumer(&self, label: MessageLabel, action: Arc<dyn ConsumerAction>) {
        self.consumers.write().insert(label, action);
    }

    pub fn supports(&self, label: &MessageLabel) -> bool {
        let consumers = self.consumers.read();
        consumers.contains_key(label) || consumers.contains_key(&MessageLabel::any())
    }

    pub fn accepted_labels(&self) -> Vec<MessageLabel> {
        let mut labels: Vec<MessageLabel> = self.consumers.read().keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Fails fast when a receiver with `options` and `failed` cannot share this listener.
    pub fn check_compatible(
        &self,
        options: &ReceiverOptions,
        failed: &Arc<dyn FailedDeliveryStrategy>,
    ) -> Result<(), BusError> {
        let mismatch = if self.options.qos != options.qos {
            Some("qos")
        } else if self.options.parallelism_level != options.parallelism_level {
            Some("parallelism_level")
        } else if self.options.accept_required != options.accept_required {
            Some("accept_required")
        } else if !Arc::ptr_eq(&self.handling.failed, failed) {
            Some("failed_delivery_strategy")
        } else {
            None
        };

        match mismatch {
            Some(option) => {
                let queue = match &self.source {
                    ListeningSource::Queue(name) => name.clone(),
                    ListeningSource::Callback => "callback".to_owned(),
                };
                error!(queue = %queue, option, "incompatible receivers share a queue");
                Err(BusError::IncompatibleListener {
                    queue,
                    option: option.to_owned(),
                })
            }
            None => Ok(()),
        }
    }

    /// Subscribes to the failure of a consumption run.
    pub fn on_failed<F: Fn(&BusError) + Send + Sync + 'static>(&self, handler: F) {
        self.failed_handlers.lock().push(Arc::new(handler));
    }

    pub fn is_consuming(&self) -> bool {
        self.timer.read().is_some()
    }

    /// Route responses to this listener must be published to. Known once the
    /// queue was declared, which for callback listeners happens on start.
    pub fn reply_route(&self) -> Option<Route> {
        if let Some(name) = self.queue_name.read().as_ref() {
            return Some(Route::to_queue(name));
        }
        match &self.source {
            ListeningSource::Queue(name) => Some(Route::to_queue(name)),
            ListeningSource::Callback => None,
        }
    }

    pub fn pending_expectations(&self) -> usize {
        self.expectations.lock().len()
    }

    /// Starts consuming. No-op when already consuming.
    pub async fn start_consuming(self: &Arc<Self>) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.token.lock() = Some(token.clone());

        let prepared = self.prepare(&token).await;
        let (connection, queue) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                *self.token.lock() = None;
                error!(url = %self.url, error = err.to_string(), "failure to start consuming");
                return Err(err);
            }
        };

        let timer = Arc::new(TicketTimer::start(self.timer_resolution));
        *self.timer.write() = Some(timer.clone());
        *self.queue_name.write() = Some(queue.clone());
        self.failed.store(false, Ordering::SeqCst);

        let workers = (0..self.options.parallelism_level.max(1))
            .map(|worker| {
                tokio::spawn(self.clone().consume(
                    worker,
                    connection.clone(),
                    queue.clone(),
                    token.clone(),
                ))
            })
            .collect();

        debug!(
            url = %self.url,
            queue = %queue,
            workers = self.options.parallelism_level.max(1),
            "listener started"
        );

        *state = Some(Running {
            token,
            workers,
            timer,
            connection,
        });

        Ok(())
    }

    /// Acquires the connection and declares what the listener consumes from.
    async fn prepare(
        &self,
        token: &CancellationToken,
    ) -> Result<(Arc<Connection>, String), BusError> {
        let connection = self
            .pool
            .get(&self.url, self.options.reuse_connection, token)
            .await?;

        let topology = self.topology.lock().clone();
        if topology.is_empty() && !self.is_callback() {
            if let ListeningSource::Queue(name) = &self.source {
                return Ok((connection, name.clone()));
            }
        }

        let channel = connection.open_channel().await?;
        let declared = async {
            topology.install(&channel).await?;
            match &self.source {
                ListeningSource::Queue(name) => Ok(name.clone()),
                ListeningSource::Callback => {
                    channel.declare_queue(&QueueDefinition::temporary()).await
                }
            }
        }
        .await;
        channel.close().await;

        Ok((connection, declared?))
    }

    /// Stops consuming: cancels the workers, waits for them, and fails every
    /// pending expectation as cancelled. Idempotent.
    pub async fn stop_consuming(&self) {
        if let Some(token) = self.token.lock().clone() {
            token.cancel();
        }

        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return;
        };

        running.token.cancel();
        for joined in join_all(running.workers).await {
            if let Err(err) = joined {
                error!(error = err.to_string(), "listener worker panicked");
            }
        }

        let pending: Vec<Arc<Expectation>> = {
            let mut expectations = self.expectations.lock();
            *self.timer.write() = None;
            expectations.drain().map(|(_, expectation)| expectation).collect()
        };
        running.timer.dispose();
        *self.token.lock() = None;

        if !pending.is_empty() {
            debug!(count = pending.len(), "cancelling pending expectations");
        }
        for expectation in pending {
            expectation.fail(BusError::Cancelled);
        }

        if !self.options.reuse_connection {
            running.connection.close().await;
        }
        if self.is_callback() {
            *self.queue_name.write() = None;
        }

        debug!(url = %self.url, "listener stopped");
    }

    /// Registers interest in the response correlated by `correlation_id`.
    /// Concurrent calls for one id share one expectation and one timeout ticket.
    pub fn expect(
        &self,
        correlation_id: &str,
        expected: MessageLabel,
        timeout: Option<Duration>,
    ) -> Result<ResponseFuture, BusError> {
        // stop_consuming clears the timer under this lock before draining
        let mut expectations = self.expectations.lock();
        let Some(timer) = self.timer.read().clone() else {
            return Err(BusError::NotConsuming(self.url.clone()));
        };

        if let Some(existing) = expectations.get(correlation_id) {
            return Ok(existing.future());
        }

        let expectation = Arc::new(Expectation::for_label(expected));
        if let Some(timeout) = timeout {
            let registry = Arc::downgrade(&self.expectations);
            let id = correlation_id.to_owned();
            let ticket = timer.acquire(timeout, move || {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let expired = registry.lock().remove(&id);
                if let Some(expectation) = expired {
                    warn!(correlation_id = %id, "request timed out");
                    expectation.fail(BusError::Timeout(id));
                }
            });
            expectation.set_ticket(ticket);
        }

        expectations.insert(correlation_id.to_owned(), expectation.clone());
        Ok(expectation.future())
    }

    /// Drops the expectation of `correlation_id`, failing its waiters as cancelled.
    pub fn forget_expectation(&self, correlation_id: &str) {
        let removed = self.expectations.lock().remove(correlation_id);
        if let Some(expectation) = removed {
            self.cancel_ticket(&expectation);
            expectation.fail(BusError::Cancelled);
        }
    }

    fn cancel_ticket(&self, expectation: &Expectation) {
        if let (Some(ticket), Some(timer)) = (expectation.ticket(), self.timer.read().as_ref()) {
            timer.cancel(ticket);
        }
    }

    /// Dispatches one delivery. Never fails: errors, and panics of the
    /// consumer, are handed to the failed delivery strategy.
    pub async fn deliver(&self, delivery: Arc<Delivery>) {
        let label = delivery.label();
        let tracer = global::tracer(otel::TRACER_NAME);
        let (_ctx, mut span) = otel::new_span(delivery.headers(), &tracer, label.name());

        let dispatched = AssertUnwindSafe(self.dispatch(&delivery, &label))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(BusError::ConsumerError(panic_message(panic.as_ref()))));
        let Err(err) = dispatched else {
            span.set_status(Status::Ok);
            return;
        };

        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });
        error!(label = %label, error = err.to_string(), "failure to handle delivery");

        let failed = FailedDelivery {
            delivery,
            error: err,
        };
        if let Err(err) = self.handling.failed.handle(failed).await {
            error!(label = %label, error = err.to_string(), "failed delivery strategy failed");
        }
    }

    async fn dispatch(
        &self,
        delivery: &Arc<Delivery>,
        label: &MessageLabel,
    ) -> Result<(), BusError> {
        if self.complete_expectation(delivery) {
            return delivery.accept().await;
        }

        let Some(consumer) = self.consumer_for(label) else {
            debug!(label = %label, "no consumer for delivery");
            return self.handling.unhandled.handle(delivery.clone()).await;
        };

        if self.handling.validators.has_validator(label) {
            let payload = delivery.payload()?;
            self.handling.validators.validate(label, &payload)?;
        }

        self.handling.header_storage.store(delivery.headers());
        consumer.consume(delivery.clone()).await?;
        delivery.accept().await
    }

    /// Completes the expectation a response delivery answers, if any.
    fn complete_expectation(&self, delivery: &Delivery) -> bool {
        let Some(correlation_id) = delivery.correlation_id() else {
            return false;
        };
        if delivery.reply_route().is_some() {
            return false;
        }

        let expectation = self.expectations.lock().remove(correlation_id);
        match expectation {
            Some(expectation) => {
                self.cancel_ticket(&expectation);
                expectation.complete(delivery);
                true
            }
            None => false,
        }
    }

    fn consumer_for(&self, label: &MessageLabel) -> Option<Arc<dyn ConsumerAction>> {
        let consumers = self.consumers.read();
        consumers
            .get(label)
            .or_else(|| consumers.get(&MessageLabel::any()))
            .or_else(|| match consumers.len() {
                1 => consumers.values().next(),
                _ => None,
            })
            .cloned()
    }

    async fn consume(
        self: Arc<Self>,
        worker: usize,
        connection: Arc<Connection>,
        queue: String,
        token: CancellationToken,
    ) {
        if let Err(err) = self.run_worker(worker, &connection, &queue, &token).await {
            if !token.is_cancelled() {
                self.raise_failed(&err);
            }
        }
    }

    async fn run_worker(
        &self,
        worker: usize,
        connection: &Connection,
        queue: &str,
        token: &CancellationToken,
    ) -> Result<(), BusError> {
        let channel = connection.open_channel().await?;
        if let Some(prefetch) = self.options.qos {
            channel.set_qos(prefetch).await?;
        }

        let tag = format!("{}-{}-{}", queue, worker, Uuid::new_v4());
        let mut deliveries = channel
            .start_consuming(queue, &tag, self.options.accept_required)
            .await?;
        debug!(queue, tag = %tag, "worker consuming");

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                next = deliveries.recv() => match next {
                    Some(native) => {
                        let delivery = Arc::new(Delivery::new(
                            channel.clone(),
                            native,
                            self.options.accept_required,
                            self.handling.converter.clone(),
                        ));
                        self.deliver(delivery).await;
                    }
                    None => break Err(BusError::ConsumerCancelled(tag.clone())),
                }
            }
        };

        self.release(&channel, &tag).await;
        result
    }

    async fn release(&self, channel: &Channel, tag: &str) {
        if channel.is_open() {
            if let Err(err) = channel.stop_consuming(tag).await {
                debug!(tag, error = err.to_string(), "failure to cancel consumer");
            }
        }
        channel.close().await;
    }

    fn raise_failed(&self, err: &BusError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(url = %self.url, error = err.to_string(), "listener failed");
        let handlers = self.failed_handlers.lock().clone();
        for handler in handlers {
            handler(err);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("consumer panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("consumer panicked: {}", message)
    } else {
        "consumer panicked".to_owned()
    }
}
