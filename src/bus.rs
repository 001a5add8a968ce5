// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus
//!
//! The bus wires everything together. Configuring it builds one fault tolerant
//! producer per sender label over one producer per broker URL, a callback
//! listener for each producer of a request sender, and the listeners of every
//! receiver with their consumers registered. Starting it starts the listeners
//! and then the producers; stopping it stops the producers, then the
//! listeners, and finally drops every pooled connection.
//!
//! A listener that fails triggers an asynchronous restart of the whole bus.

use crate::{
    config::{BusSettings, ReceiverOptions, SenderOptions},
    connection::ConnectionSettings,
    errors::BusError,
    fault_tolerant::{FaultTolerantProducer, MessageExchange},
    label::MessageLabel,
    listener::DeliveryHandling,
    message::{Headers, Message},
    pool::ConnectionPool,
    producer::{MessageSender, SenderHandling},
    registry::{ListenerRegistry, ProducerRegistry},
    route::Endpoint,
    selector::{DefaultProducerSelectorBuilder, ProducerSelectorBuilder},
    strategy::ConsumerAction,
    topology::Topology,
    transport::Transport,
};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// A label the bus publishes, with how it is published.
#[derive(Clone)]
pub struct SenderConfiguration {
    pub label: MessageLabel,
    pub options: SenderOptions,
    pub handling: SenderHandling,
}

impl SenderConfiguration {
    pub fn new(label: MessageLabel) -> SenderConfiguration {
        SenderConfiguration {
            label,
            options: SenderOptions::default(),
            handling: SenderHandling::default(),
        }
    }

    pub fn with_options(mut self, options: SenderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_handling(mut self, handling: SenderHandling) -> Self {
        self.handling = handling;
        self
    }
}

/// A queue the bus consumes, with the consumers of its labels.
#[derive(Clone)]
pub struct ReceiverConfiguration {
    pub queue: String,
    pub options: ReceiverOptions,
    /// Collaborators of this receiver; the bus defaults when unset.
    pub handling: Option<DeliveryHandling>,
    pub topology: Topology,
    pub consumers: Vec<(MessageLabel, Arc<dyn ConsumerAction>)>,
}

impl ReceiverConfiguration {
    pub fn new(queue: &str) -> ReceiverConfiguration {
        ReceiverConfiguration {
            queue: queue.to_owned(),
            options: ReceiverOptions::default(),
            handling: None,
            topology: Topology::default(),
            consumers: vec![],
        }
    }

    pub fn with_options(mut self, options: ReceiverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_handling(mut self, handling: DeliveryHandling) -> Self {
        self.handling = Some(handling);
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn consume(mut self, label: MessageLabel, action: Arc<dyn ConsumerAction>) -> Self {
        self.consumers.push((label, action));
        self
    }
}

/// Everything a bus is built from.
pub struct BusConfiguration {
    pub transport: Arc<dyn Transport>,
    pub senders: Vec<SenderConfiguration>,
    pub receivers: Vec<ReceiverConfiguration>,
    pub selector: Arc<dyn ProducerSelectorBuilder>,
    /// Default delivery collaborators, shared by every receiver without its own.
    pub delivery: DeliveryHandling,
}

impl BusConfiguration {
    pub fn new(transport: Arc<dyn Transport>) -> BusConfiguration {
        BusConfiguration {
            transport,
            senders: vec![],
            receivers: vec![],
            selector: Arc::new(DefaultProducerSelectorBuilder::default()),
            delivery: DeliveryHandling::default(),
        }
    }

    pub fn sender(mut self, sender: SenderConfiguration) -> Self {
        self.senders.push(sender);
        self
    }

    pub fn receiver(mut self, receiver: ReceiverConfiguration) -> Self {
        self.receivers.push(receiver);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn ProducerSelectorBuilder>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_delivery_handling(mut self, delivery: DeliveryHandling) -> Self {
        self.delivery = delivery;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Created,
    Configured,
    Started,
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            BusState::Created => "created",
            BusState::Configured => "configured",
            BusState::Started => "started",
            BusState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

pub struct Bus {
    this: Weak<Bus>,
    settings: BusSettings,
    config: BusConfiguration,
    pool: Arc<ConnectionPool>,
    listeners: ListenerRegistry,
    producers: ProducerRegistry,
    senders: RwLock<HashMap<MessageLabel, Arc<FaultTolerantProducer>>>,
    state: RwLock<BusState>,
    lifecycle: tokio::sync::Mutex<()>,
    restarting: AtomicBool,
}

impl Bus {
    pub fn new(settings: BusSettings, config: BusConfiguration) -> Result<Arc<Bus>, BusError> {
        settings.validate()?;

        let pool = Arc::new(ConnectionPool::new(
            config.transport.clone(),
            ConnectionSettings {
                name: settings.name.clone(),
                retry: settings.retry.clone(),
                close_timeout: settings.close_timeout(),
            },
        ));

        Ok(Arc::new_cyclic(|this| Bus {
            this: this.clone(),
            listeners: ListenerRegistry::new(pool.clone(), settings.timer_resolution()),
            producers: ProducerRegistry::new(pool.clone()),
            settings,
            config,
            pool,
            senders: RwLock::new(HashMap::default()),
            state: RwLock::new(BusState::Created),
            lifecycle: tokio::sync::Mutex::new(()),
            restarting: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> BusState {
        *self.state.read()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Builds producers and listeners. Idempotent once configured.
    pub async fn configure(&self) -> Result<(), BusError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.configure_components()
    }

    fn configure_components(&self) -> Result<(), BusError> {
        match self.state() {
            BusState::Created => {}
            BusState::Configured => return Ok(()),
            state => return Err(BusError::InvalidState(state.to_string())),
        }

        let result = self
            .configure_senders()
            .and_then(|_| self.configure_receivers());
        if let Err(err) = result {
            error!(bus = %self.settings.name, error = err.to_string(), "failure to configure bus");
            self.senders.write().clear();
            self.producers.clear();
            self.listeners.clear();
            return Err(err);
        }

        *self.state.write() = BusState::Configured;
        debug!(bus = %self.settings.name, "bus configured");
        Ok(())
    }

    fn configure_senders(&self) -> Result<(), BusError> {
        for sender in &self.config.senders {
            if self.senders.read().contains_key(&sender.label) {
                return Err(BusError::ConfigurationError(format!(
                    "label `{}` is configured by more than one sender",
                    sender.label
                )));
            }

            let urls = sender.options.urls(&self.settings.connection_string);
            if urls.is_empty() {
                return Err(BusError::ConfigurationError(format!(
                    "sender `{}` has no broker url",
                    sender.label
                )));
            }

            let mut members: Vec<Arc<dyn MessageSender>> = Vec::with_capacity(urls.len());
            for url in urls {
                let endpoint = Endpoint {
                    name: self.settings.name.clone(),
                    url,
                };
                let (producer, created) =
                    self.producers
                        .resolve(&sender.label, &endpoint, &sender.options, &sender.handling);

                if let (true, Some(callback)) = (created, &sender.options.callback) {
                    let listener = self.listeners.resolve_callback(
                        &endpoint.url,
                        callback,
                        &self.config.delivery,
                    );
                    producer.use_callback_listener(listener)?;
                }
                members.push(producer);
            }

            let attempts = sender.options.attempts(members.len());
            let selector = self.config.selector.build(members);
            self.senders.write().insert(
                sender.label.clone(),
                Arc::new(FaultTolerantProducer::new(sender.label.clone(), selector, attempts)),
            );
        }

        Ok(())
    }

    fn configure_receivers(&self) -> Result<(), BusError> {
        for receiver in &self.config.receivers {
            let handling = receiver
                .handling
                .clone()
                .unwrap_or_else(|| self.config.delivery.clone());

            for url in receiver.options.urls(&self.settings.connection_string) {
                let listener = self
                    .listeners
                    .resolve(&url, &receiver.queue, &receiver.options, &handling)?;
                listener.extend_topology(receiver.topology.clone());
                for (label, action) in &receiver.consumers {
                    listener.register_consumer(label.clone(), action.clone())?;
                }
            }
        }

        let runtime = Handle::try_current().ok();
        for listener in self.listeners.listeners() {
            let bus = self.this.clone();
            let runtime = runtime.clone();
            listener.on_failed(move |err| {
                let (Some(bus), Some(runtime)) = (bus.upgrade(), runtime.as_ref()) else {
                    return;
                };
                if bus.restarting.swap(true, Ordering::SeqCst) {
                    return;
                }
                warn!(
                    bus = %bus.settings.name,
                    error = err.to_string(),
                    "listener failed, restarting bus"
                );
                runtime.spawn(async move {
                    if let Err(err) = bus.restart().await {
                        error!(
                            bus = %bus.settings.name,
                            error = err.to_string(),
                            "failure to restart bus"
                        );
                    }
                    bus.restarting.store(false, Ordering::SeqCst);
                });
            });
        }

        Ok(())
    }

    /// Configures the bus if needed, then starts listeners and producers.
    pub async fn start(&self) -> Result<(), BusError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_components().await
    }

    async fn start_components(&self) -> Result<(), BusError> {
        match self.state() {
            BusState::Started => return Ok(()),
            BusState::Created => self.configure_components()?,
            BusState::Configured | BusState::Stopped => {}
        }

        let started = match self.listeners.start_all().await {
            Ok(()) => self.producers.start_all().await,
            Err(err) => Err(err),
        };
        if let Err(err) = started {
            error!(bus = %self.settings.name, error = err.to_string(), "failure to start bus");
            self.stop_components().await;
            return Err(err);
        }

        *self.state.write() = BusState::Started;
        info!(bus = %self.settings.name, "bus started");
        Ok(())
    }

    /// Stops producers, then listeners, then drops every connection. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == BusState::Started {
            self.stop_components().await;
        }
    }

    async fn stop_components(&self) {
        self.producers.stop_all().await;
        self.listeners.stop_all().await;
        self.pool.drop_all().await;

        *self.state.write() = BusState::Stopped;
        info!(bus = %self.settings.name, "bus stopped");
    }

    pub async fn restart(&self) -> Result<(), BusError> {
        let _lifecycle = self.lifecycle.lock().await;
        info!(bus = %self.settings.name, "restarting bus");
        if self.state() == BusState::Started {
            self.stop_components().await;
        }
        self.start_components().await
    }

    /// Publishes `payload` under `label`.
    pub async fn emit(
        &self,
        label: MessageLabel,
        payload: serde_json::Value,
        headers: Headers,
    ) -> Result<(), BusError> {
        let sender = self.sender_for(&label)?;
        let message = Message::new(label, payload).with_headers(headers);
        sender.try_send(MessageExchange::publish(message)).await?;
        Ok(())
    }

    /// Publishes `payload` under `label` and waits for the `expected` response.
    pub async fn request(
        &self,
        label: MessageLabel,
        payload: serde_json::Value,
        expected: MessageLabel,
        headers: Headers,
    ) -> Result<Message, BusError> {
        let sender = self.sender_for(&label)?;
        let message = Message::new(label, payload).with_headers(headers);
        let exchange = sender
            .try_send(MessageExchange::request(message, expected))
            .await?;

        exchange.inbound.ok_or_else(|| {
            BusError::InternalError("request completed without a response".to_owned())
        })
    }

    fn sender_for(&self, label: &MessageLabel) -> Result<Arc<FaultTolerantProducer>, BusError> {
        let state = self.state();
        if state != BusState::Started {
            return Err(BusError::InvalidState(state.to_string()));
        }
        self.senders
            .read()
            .get(label)
            .cloned()
            .ok_or_else(|| BusError::NoRoute(label.to_string()))
    }

    /// Tells whether a sender is configured for `label`.
    pub fn can_route(&self, label: &MessageLabel) -> bool {
        self.senders.read().contains_key(label)
    }

    /// Tells whether a receiver consumes `label`.
    pub fn can_handle(&self, label: &MessageLabel) -> bool {
        self.listeners
            .listeners()
            .iter()
            .any(|listener| listener.supports(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetryPolicy,
        route::{Route, StaticRouteResolver},
        strategy::consumer_fn,
        transport::memory::InMemoryBroker,
    };
    use serde_json::json;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    fn settings() -> BusSettings {
        BusSettings::new("test-bus")
            .with_connection_string("mem://")
            .with_timer_resolution(Duration::from_millis(50))
            .with_retry(RetryPolicy::new(Duration::from_millis(10), 10))
    }

    fn to_queue(queue: &str) -> SenderHandling {
        SenderHandling {
            resolver: Arc::new(StaticRouteResolver(Route::to_queue(queue))),
            ..SenderHandling::default()
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn ConsumerAction> {
        let counter = counter.clone();
        consumer_fn(move |_delivery| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn moves_through_its_states() {
        let config = BusConfiguration::new(Arc::new(InMemoryBroker::new()));
        let bus = Bus::new(settings(), config).unwrap();
        assert_eq!(bus.state(), BusState::Created);

        bus.configure().await.unwrap();
        assert_eq!(bus.state(), BusState::Configured);

        bus.start().await.unwrap();
        assert_eq!(bus.state(), BusState::Started);

        bus.stop().await;
        bus.stop().await;
        assert_eq!(bus.state(), BusState::Stopped);

        assert_eq!(bus.configure().await, Err(BusError::InvalidState("stopped".to_owned())));
    }

    #[tokio::test]
    async fn rejects_invalid_settings() {
        let result = Bus::new(
            BusSettings::new("").with_connection_string("mem://"),
            BusConfiguration::new(Arc::new(InMemoryBroker::new())),
        );
        assert!(matches!(result, Err(BusError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn emits_only_when_started_and_routed() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let config = BusConfiguration::new(Arc::new(broker.clone()))
            .sender(
                SenderConfiguration::new(MessageLabel::new("boo")).with_handling(to_queue("q")),
            );
        let bus = Bus::new(settings(), config).unwrap();

        assert_eq!(
            bus.emit(MessageLabel::new("boo"), json!({}), Headers::default()).await,
            Err(BusError::InvalidState("created".to_owned()))
        );

        bus.start().await.unwrap();
        assert!(bus.can_route(&MessageLabel::new("boo")));
        assert!(!bus.can_route(&MessageLabel::new("foo")));
        assert_eq!(
            bus.emit(MessageLabel::new("foo"), json!({}), Headers::default()).await,
            Err(BusError::NoRoute("foo".to_owned()))
        );

        bus.emit(MessageLabel::new("boo"), json!({"num": 1}), Headers::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
        bus.stop().await;
    }

    #[tokio::test]
    async fn duplicate_senders_fail_configuration() {
        let config = BusConfiguration::new(Arc::new(InMemoryBroker::new()))
            .sender(SenderConfiguration::new(MessageLabel::new("boo")))
            .sender(SenderConfiguration::new(MessageLabel::new("boo")));
        let bus = Bus::new(settings(), config).unwrap();

        assert!(matches!(bus.configure().await, Err(BusError::ConfigurationError(_))));
        assert_eq!(bus.state(), BusState::Created);
    }

    #[tokio::test]
    async fn emitted_messages_reach_their_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let consumed = Arc::new(AtomicUsize::new(0));
        let config = BusConfiguration::new(Arc::new(broker.clone()))
            .sender(
                SenderConfiguration::new(MessageLabel::new("boo")).with_handling(to_queue("q")),
            )
            .receiver(
                ReceiverConfiguration::new("q")
                    .consume(MessageLabel::new("boo"), counting(&consumed)),
            );
        let bus = Bus::new(settings(), config).unwrap();
        bus.start().await.unwrap();

        assert!(bus.can_handle(&MessageLabel::new("boo")));
        assert!(!bus.can_handle(&MessageLabel::new("foo")));

        bus.emit(MessageLabel::new("boo"), json!({"num": 1}), Headers::default())
            .await
            .unwrap();
        wait_for(&consumed, 1).await;

        assert_eq!(consumed.load(Ordering::SeqCst), 1);
        bus.stop().await;
        assert_eq!(bus.pool().count(), 0);
    }

    #[tokio::test]
    async fn incompatible_receivers_of_one_queue_fail_configuration() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let consumed = Arc::new(AtomicUsize::new(0));
        let config = BusConfiguration::new(Arc::new(broker.clone()))
            .receiver(
                ReceiverConfiguration::new("q")
                    .consume(MessageLabel::new("boo"), counting(&consumed)),
            )
            .receiver(
                ReceiverConfiguration::new("q")
                    .consume(MessageLabel::new("foo"), counting(&consumed)),
            )
            .receiver(
                ReceiverConfiguration::new("q")
                    .with_options(ReceiverOptions::default().with_qos(5))
                    .consume(MessageLabel::new("zoo"), counting(&consumed)),
            );
        let bus = Bus::new(settings(), config).unwrap();

        assert!(matches!(
            bus.configure().await,
            Err(BusError::IncompatibleListener { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listener_failure_restarts_the_bus() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let consumed = Arc::new(AtomicUsize::new(0));
        let config = BusConfiguration::new(Arc::new(broker.clone()))
            .sender(
                SenderConfiguration::new(MessageLabel::new("boo")).with_handling(to_queue("q")),
            )
            .receiver(
                ReceiverConfiguration::new("q")
                    .consume(MessageLabel::new("boo"), counting(&consumed)),
            );
        let bus = Bus::new(settings(), config).unwrap();
        bus.start().await.unwrap();

        broker.sever_connections("broker restart");
        for _ in 0..100 {
            if broker.consumer_count("q") == 1 && bus.state() == BusState::Started {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        bus.emit(MessageLabel::new("boo"), json!({}), Headers::default())
            .await
            .unwrap();
        wait_for(&consumed, 1).await;
        assert_eq!(consumed.load(Ordering::SeqCst), 1);
        bus.stop().await;
    }
}
