// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A small in-process broker implementing the transport traits. It supports
//! the default exchange plus direct, fanout, topic and headers exchanges
//! (headers exchanges route like fanout), round-robin delivery across the
//! consumers of a queue, per-channel unacknowledged tracking with requeue, and
//! publisher confirms.
//!
//! Faults can be injected to exercise recovery paths: refusing connection
//! attempts, negatively confirming publishes, and severing every connection as
//! if the broker went down.

use super::{
    ConfirmationHandler, DeliveryReceiver, NativeChannel, NativeConnection, NativeDelivery,
    NativeProperties, ShutdownHandler, Transport,
};
use crate::{
    errors::BusError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::Headers,
    queue::{QueueBinding, QueueDefinition},
    route::Route,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
struct Envelope {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: NativeProperties,
    body: Vec<u8>,
}

struct MemoryConsumer {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<NativeDelivery>,
}

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<Envelope>,
    consumers: Vec<MemoryConsumer>,
    cursor: usize,
    exclusive_owner: Option<u64>,
}

struct MemoryExchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

struct ChannelRecord {
    connection_id: u64,
    open: bool,
    next_tag: u64,
    unacked: HashMap<u64, (String, Envelope)>,
    confirms: bool,
    next_seq_no: u64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, MemoryExchange>,
    channels: HashMap<u64, ChannelRecord>,
    connections: HashMap<u64, Weak<MemoryConnection>>,
    next_id: u64,
    refused_connects: usize,
    connect_attempts: usize,
    nack_publishes: bool,
    published: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, envelope: Envelope) {
        let targets: Vec<String> = if envelope.exchange.is_empty() {
            vec![envelope.routing_key.clone()]
        } else {
            match self.exchanges.get(&envelope.exchange) {
                Some(exchange) => exchange
                    .bindings
                    .iter()
                    .filter(|(_, key)| match exchange.kind {
                        ExchangeKind::Fanout | ExchangeKind::Headers => true,
                        ExchangeKind::Topic => topic_matches(key, &envelope.routing_key),
                        ExchangeKind::Direct | ExchangeKind::XMessageDelayed => {
                            key == &envelope.routing_key
                        }
                    })
                    .map(|(queue, _)| queue.clone())
                    .collect(),
                None => vec![],
            }
        };

        for queue in targets {
            self.enqueue(&queue, envelope.clone());
        }
    }

    fn enqueue(&mut self, queue_name: &str, envelope: Envelope) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            debug!(queue = queue_name, "dropping message for unknown queue");
            return;
        };

        while !queue.consumers.is_empty() {
            let index = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);

            let consumer = &queue.consumers[index];
            let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                queue.consumers.remove(index);
                continue;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = NativeDelivery {
                delivery_tag: tag,
                exchange: envelope.exchange.clone(),
                routing_key: envelope.routing_key.clone(),
                redelivered: envelope.redelivered,
                properties: envelope.properties.clone(),
                body: envelope.body.clone(),
            };

            if consumer.sender.send(delivery).is_ok() {
                if !consumer.no_ack {
                    channel
                        .unacked
                        .insert(tag, (queue_name.to_owned(), envelope));
                }
                return;
            }

            queue.consumers.remove(index);
        }

        queue.messages.push_back(envelope);
    }

    fn drain(&mut self, queue_name: &str) {
        let pending: Vec<Envelope> = match self.queues.get_mut(queue_name) {
            Some(queue) if !queue.consumers.is_empty() => queue.messages.drain(..).collect(),
            _ => return,
        };

        for envelope in pending {
            self.enqueue(queue_name, envelope);
        }
    }

    /// Closes the channel record: drops its consumers and requeues what it left unacknowledged.
    fn close_channel(&mut self, channel_id: u64) -> bool {
        let Some(record) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        if !record.open {
            return false;
        }
        record.open = false;
        let unacked: Vec<(String, Envelope)> = record.unacked.drain().map(|(_, v)| v).collect();

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        for (queue, mut envelope) in unacked {
            envelope.redelivered = true;
            self.enqueue(&queue, envelope);
        }

        true
    }

    fn close_connection(&mut self, connection_id: u64) -> Vec<u64> {
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, record)| record.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();

        let closed = channel_ids
            .into_iter()
            .filter(|id| self.close_channel(*id))
            .collect();

        self.queues
            .retain(|_, queue| queue.exclusive_owner != Some(connection_id));
        self.connections.remove(&connection_id);

        closed
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// An in-process broker. Clones share the same broker state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connections(&self, count: usize) {
        self.state.lock().refused_connects = count;
    }

    /// Negatively confirms every publish while set.
    pub fn nack_publishes(&self, nack: bool) {
        self.state.lock().nack_publishes = nack;
    }

    /// Drops every connection as if the broker went away.
    pub fn sever_connections(&self, reason: &str) {
        let connections: Vec<Arc<MemoryConnection>> = self
            .state
            .lock()
            .connections
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        for connection in connections {
            connection.sever(reason);
        }
    }

    /// Declares a queue outside of any connection.
    pub fn declare_queue(&self, name: &str) {
        self.state.lock().queues.entry(name.to_owned()).or_default();
    }

    /// Declares an exchange outside of any connection.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.state
            .lock()
            .exchanges
            .entry(name.to_owned())
            .or_insert(MemoryExchange {
                kind,
                bindings: vec![],
            });
    }

    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        if let Some(exchange) = self.state.lock().exchanges.get_mut(exchange) {
            exchange
                .bindings
                .push((queue.to_owned(), routing_key.to_owned()));
        }
    }

    /// Publishes a message as if it came from another client.
    pub fn inject(&self, route: &Route, properties: NativeProperties, body: &[u8]) {
        let mut state = self.state.lock();
        state.published += 1;
        state.route(Envelope {
            exchange: route.exchange.clone(),
            routing_key: route.routing_key.clone(),
            redelivered: false,
            properties,
            body: body.to_vec(),
        });
    }

    /// Messages waiting in the queue that no consumer has received yet.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages handed to consumers of the queue and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|record| record.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn published(&self) -> usize {
        self.state.lock().published
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(
        &self,
        url: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn NativeConnection>, BusError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(BusError::ConnectionError(url.to_owned()));
        }

        let id = state.next_id();
        let connection = Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            open: Mutex::new(true),
            channels: Mutex::new(vec![]),
            shutdown: Mutex::new(vec![]),
        });
        state.connections.insert(id, Arc::downgrade(&connection));

        Ok(connection)
    }
}

/// A connection to the in-memory broker.
pub struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    open: Mutex<bool>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
    shutdown: Mutex<Vec<ShutdownHandler>>,
}

impl MemoryConnection {
    fn sever(&self, reason: &str) {
        {
            let mut open = self.open.lock();
            if !*open {
                return;
            }
            *open = false;
        }

        self.broker.state.lock().close_connection(self.id);

        let channels: Vec<Arc<MemoryChannel>> =
            self.channels.lock().iter().filter_map(Weak::upgrade).collect();
        for channel in channels {
            channel.fire_shutdown(reason);
        }

        for handler in self.shutdown.lock().iter() {
            handler(reason.to_owned());
        }
    }
}

#[async_trait]
impl NativeConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    async fn create_channel(&self) -> Result<Arc<dyn NativeChannel>, BusError> {
        if !self.is_open() {
            return Err(BusError::ChannelError("connection is closed".to_owned()));
        }

        let id = {
            let mut state = self.broker.state.lock();
            let id = state.next_id();
            state.channels.insert(
                id,
                ChannelRecord {
                    connection_id: self.id,
                    open: true,
                    next_tag: 0,
                    unacked: HashMap::default(),
                    confirms: false,
                    next_seq_no: 0,
                },
            );
            id
        };

        let channel = Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            broker: self.broker.clone(),
            shutdown: Mutex::new(vec![]),
            confirmation: Mutex::new(None),
        });
        self.channels.lock().push(Arc::downgrade(&channel));

        Ok(channel)
    }

    async fn close(&self) -> Result<(), BusError> {
        {
            let mut open = self.open.lock();
            if !*open {
                return Err(BusError::ConnectionShutdown("already closed".to_owned()));
            }
            *open = false;
        }

        self.broker.state.lock().close_connection(self.id);
        Ok(())
    }

    fn abort(&self) {
        *self.open.lock() = false;
        self.broker.state.lock().close_connection(self.id);
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        self.shutdown.lock().push(handler);
    }
}

/// A channel on an in-memory connection.
pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: InMemoryBroker,
    shutdown: Mutex<Vec<ShutdownHandler>>,
    confirmation: Mutex<Option<ConfirmationHandler>>,
}

impl MemoryChannel {
    fn fire_shutdown(&self, reason: &str) {
        for handler in self.shutdown.lock().iter() {
            handler(reason.to_owned());
        }
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::ChannelShutdown("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl NativeChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker
            .state
            .lock()
            .channels
            .get(&self.id)
            .map(|record| record.open)
            .unwrap_or(false)
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), BusError> {
        self.ensure_open()
    }

    async fn confirm_select(&self) -> Result<(), BusError> {
        let mut state = self.broker.state.lock();
        match state.channels.get_mut(&self.id) {
            Some(record) if record.open => {
                record.confirms = true;
                record.next_seq_no = 1;
                Ok(())
            }
            _ => Err(BusError::ChannelShutdown("channel is closed".to_owned())),
        }
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.broker
            .state
            .lock()
            .channels
            .get(&self.id)
            .filter(|record| record.confirms)
            .map(|record| record.next_seq_no)
            .unwrap_or(0)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: NativeProperties,
    ) -> Result<(), BusError> {
        let confirmation = {
            let mut state = self.broker.state.lock();
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(BusError::PublishingError(format!(
                    "no exchange `{}`",
                    exchange
                )));
            }

            let nack = state.nack_publishes;
            let confirmation = match state.channels.get_mut(&self.id) {
                Some(record) if record.open => {
                    if record.confirms {
                        let seq_no = record.next_seq_no;
                        record.next_seq_no += 1;
                        Some((!nack, seq_no))
                    } else {
                        None
                    }
                }
                _ => return Err(BusError::ChannelShutdown("channel is closed".to_owned())),
            };

            state.published += 1;
            state.route(Envelope {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties,
                body: body.to_vec(),
            });
            confirmation
        };

        if let Some((confirmed, seq_no)) = confirmation {
            let handler = self.confirmation.lock().clone();
            if let Some(handler) = handler {
                handler(confirmed, seq_no, false);
            }
        }

        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        let mut state = self.broker.state.lock();
        match state.channels.get_mut(&self.id) {
            Some(record) if record.open => {
                record.unacked.remove(&delivery_tag);
                Ok(())
            }
            _ => Err(BusError::AckMessageError),
        }
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        let mut state = self.broker.state.lock();
        let rejected = match state.channels.get_mut(&self.id) {
            Some(record) if record.open => record.unacked.remove(&delivery_tag),
            _ => return Err(BusError::NackMessageError),
        };

        if let (true, Some((queue, mut envelope))) = (requeue, rejected) {
            envelope.redelivered = true;
            state.enqueue(&queue, envelope);
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryReceiver, BusError> {
        let mut state = self.broker.state.lock();
        if !state.channels.get(&self.id).map(|r| r.open).unwrap_or(false) {
            return Err(BusError::ChannelShutdown("channel is closed".to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(MemoryConsumer {
                tag: consumer_tag.to_owned(),
                channel_id: self.id,
                no_ack,
                sender: tx,
            }),
            None => return Err(BusError::BindingConsumerError(consumer_tag.to_owned())),
        }

        state.drain(queue);
        Ok(rx)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let mut state = self.broker.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        match state.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind => {
                Err(BusError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(BusError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(
                    def.name.clone(),
                    MemoryExchange {
                        kind: def.kind.clone(),
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        def: &QueueDefinition,
        _arguments: Headers,
    ) -> Result<String, BusError> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_owned()
        };

        let mut state = self.broker.state.lock();
        match state.queues.get(&name) {
            Some(queue)
                if queue.exclusive_owner.is_some()
                    && queue.exclusive_owner != Some(self.connection_id) =>
            {
                Err(BusError::DeclareQueueError(name))
            }
            Some(_) => Ok(name),
            None if def.passive => Err(BusError::DeclareQueueError(name)),
            None => {
                state.queues.insert(
                    name.clone(),
                    MemoryQueue {
                        exclusive_owner: def.exclusive.then_some(self.connection_id),
                        ..MemoryQueue::default()
                    },
                );
                Ok(name)
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(&binding.queue_name) {
            return Err(BusError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        match state.exchanges.get_mut(&binding.exchange_name) {
            Some(exchange) => {
                let entry = (binding.queue_name.clone(), binding.routing_key.clone());
                if !exchange.bindings.contains(&entry) {
                    exchange.bindings.push(entry);
                }
                Ok(())
            }
            None => Err(BusError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )),
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.broker.state.lock().close_channel(self.id) {
            Ok(())
        } else {
            Err(BusError::ChannelShutdown("already closed".to_owned()))
        }
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        self.shutdown.lock().push(handler);
    }

    fn on_confirmation(&self, handler: ConfirmationHandler) {
        *self.confirmation.lock() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "orders.created"));
        assert!(!topic_matches("invoices.*", "orders.created"));
    }

    #[tokio::test]
    async fn routes_through_direct_exchange_to_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("orders", ExchangeKind::Direct);
        broker.declare_queue("orders-q");
        broker.bind("orders-q", "orders", "created");

        let conn = broker.connect("mem://", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let mut rx = channel.basic_consume("orders-q", "c1", false).await.unwrap();

        channel
            .basic_publish("orders", "created", b"{}", NativeProperties::default())
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "created");
        assert_eq!(broker.unacked("orders-q"), 1);

        channel.basic_ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked("orders-q"), 0);
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_messages() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");

        let conn = broker.connect("mem://", "test").await.unwrap();
        let first = conn.create_channel().await.unwrap();
        let mut rx = first.basic_consume("q", "c1", false).await.unwrap();
        broker.inject(&Route::to_queue("q"), NativeProperties::default(), b"1");
        assert!(rx.recv().await.is_some());

        first.close().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);

        let second = conn.create_channel().await.unwrap();
        let mut rx = second.basic_consume("q", "c2", false).await.unwrap();
        let redelivered = rx.recv().await.unwrap();
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn confirms_are_numbered_from_one() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let conn = broker.connect("mem://", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        channel.on_confirmation(Arc::new(move |ok, seq, multiple| {
            sink.lock().push((ok, seq, multiple));
        }));

        assert_eq!(channel.next_publish_seq_no(), 0);
        channel.confirm_select().await.unwrap();
        assert_eq!(channel.next_publish_seq_no(), 1);

        channel
            .basic_publish("", "q", b"a", NativeProperties::default())
            .await
            .unwrap();
        broker.nack_publishes(true);
        channel
            .basic_publish("", "q", b"b", NativeProperties::default())
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![(true, 1, false), (false, 2, false)]);
    }

    #[tokio::test]
    async fn severing_fires_shutdown_handlers_and_ends_consumers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let conn = broker.connect("mem://", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let mut rx = channel.basic_consume("q", "c1", false).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.on_shutdown(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = fired.clone();
        channel.on_shutdown(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        broker.sever_connections("broker restart");

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(rx.recv().await.is_none());
        assert!(!conn.is_open());
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn refused_connections_count_down() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(1);

        assert!(broker.connect("mem://", "test").await.is_err());
        assert!(broker.connect("mem://", "test").await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
