// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! `lapin` backed implementation of the transport traits. It handles the
//! creation of AMQP connections and channels and converts between the bus'
//! transport neutral types and lapin's protocol types.

use super::{
    ConfirmationHandler, DeliveryReceiver, NativeChannel, NativeConnection, NativeDelivery,
    NativeProperties, ShutdownHandler, Transport,
};
use crate::{
    errors::BusError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{HeaderValue, Headers},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Opens AMQP connections with `lapin`.
#[derive(Debug, Default, Clone)]
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn NativeConnection>, BusError> {
        debug!(url, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(url, options).await {
            Ok(conn) => {
                debug!(url, "amqp connected");
                Ok(Arc::new(AmqpConnection {
                    inner: Mutex::new(Some(Arc::new(conn))),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), url, "failure to connect");
                Err(BusError::ConnectionError(url.to_owned()))
            }
        }
    }
}

struct AmqpConnection {
    inner: Mutex<Option<Arc<Connection>>>,
}

impl AmqpConnection {
    fn handle(&self) -> Result<Arc<Connection>, BusError> {
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| BusError::ConnectionShutdown("connection aborted".to_owned()))
    }
}

#[async_trait]
impl NativeConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .map(|conn| conn.status().connected())
            .unwrap_or(false)
    }

    async fn create_channel(&self) -> Result<Arc<dyn NativeChannel>, BusError> {
        debug!("creating amqp channel...");
        match self.handle()?.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(BusError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        self.handle()?
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| BusError::ConnectionShutdown(err.to_string()))
    }

    fn abort(&self) {
        // Dropping the last handle tears the socket down without the close handshake.
        self.inner.lock().take();
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        if let Some(conn) = self.inner.lock().as_ref() {
            conn.on_error(move |err| handler(err.to_string()));
        }
    }
}

struct AmqpChannel {
    inner: Channel,
    confirms: AtomicBool,
    next_seq_no: AtomicU64,
    confirmation: Arc<RwLock<Option<ConfirmationHandler>>>,
}

impl AmqpChannel {
    fn new(inner: Channel) -> AmqpChannel {
        AmqpChannel {
            inner,
            confirms: AtomicBool::new(false),
            next_seq_no: AtomicU64::new(0),
            confirmation: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl NativeChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BusError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                BusError::QoSDeclarationError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), BusError> {
        self.inner
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| BusError::ChannelError(err.to_string()))?;

        // lapin numbers confirms from 1 once the channel is in confirm mode.
        self.next_seq_no.store(1, Ordering::SeqCst);
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.next_seq_no.load(Ordering::SeqCst)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: NativeProperties,
    ) -> Result<(), BusError> {
        let confirm = match self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(BusError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(());
        }

        let seq_no = self.next_seq_no.fetch_add(1, Ordering::SeqCst);
        let handler = self.confirmation.read().clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(confirmation) => {
                    if let Some(handler) = handler {
                        handler(confirmation.is_ack(), seq_no, false);
                    }
                }
                // The channel is gone; its shutdown notification fails the pending publish.
                Err(err) => warn!(error = err.to_string(), seq_no, "confirmation lost"),
            }
        });

        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                BusError::AckMessageError
            })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                BusError::NackMessageError
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryReceiver, BusError> {
        let mut consumer = match self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(BusError::BindingConsumerError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tag = consumer_tag.to_owned();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if tx.send(from_lapin_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), tag = %tag, "errors consume msg");
                        break;
                    }
                }
            }
            debug!(tag = %tag, "consumer stream ended");
        });

        Ok(rx)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| BusError::ChannelError(err.to_string()))
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        let kind = match &def.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(ExchangeKind::XMessageDelayed.as_str().to_owned())
            }
        };

        self.inner
            .exchange_declare(
                &def.name,
                kind,
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                to_field_table(&def.params),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                BusError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        def: &QueueDefinition,
        arguments: Headers,
    ) -> Result<String, BusError> {
        match self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                to_field_table(&arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "failure to declare queue");
                Err(BusError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => Ok(queue.name().as_str().to_owned()),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                BusError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn close(&self) -> Result<(), BusError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| BusError::ChannelShutdown(err.to_string()))
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        self.inner.on_error(move |err| handler(err.to_string()));
    }

    fn on_confirmation(&self, handler: ConfirmationHandler) {
        *self.confirmation.write() = Some(handler);
    }
}

fn from_lapin_delivery(delivery: Delivery) -> NativeDelivery {
    NativeDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_owned())
}

fn from_basic_properties(props: &BasicProperties) -> NativeProperties {
    NativeProperties {
        content_type: short(props.content_type()),
        message_id: short(props.message_id()),
        correlation_id: short(props.correlation_id()),
        reply_to: short(props.reply_to()),
        kind: short(props.kind()),
        timestamp: *props.timestamp(),
        expiration: short(props.expiration()),
        delivery_mode: *props.delivery_mode(),
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

fn to_basic_properties(props: NativeProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(to_field_table(&props.headers));

    if let Some(v) = props.content_type {
        basic = basic.with_content_type(ShortString::from(v));
    }
    if let Some(v) = props.message_id {
        basic = basic.with_message_id(ShortString::from(v));
    }
    if let Some(v) = props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(v));
    }
    if let Some(v) = props.reply_to {
        basic = basic.with_reply_to(ShortString::from(v));
    }
    if let Some(v) = props.kind {
        basic = basic.with_type(ShortString::from(v));
    }
    if let Some(v) = props.timestamp {
        basic = basic.with_timestamp(v);
    }
    if let Some(v) = props.expiration {
        basic = basic.with_expiration(ShortString::from(v));
    }
    if let Some(v) = props.delivery_mode {
        basic = basic.with_delivery_mode(v);
    }

    basic
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    FieldTable::from(btree)
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::List(items) => {
            let items: Vec<AMQPValue> = items.iter().map(to_amqp_value).collect();
            AMQPValue::FieldArray(FieldArray::from(items))
        }
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| from_amqp_value(value).map(|v| (key.as_str().to_owned(), v)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok().map(HeaderValue::Int),
        AMQPValue::ShortString(v) => Some(HeaderValue::Str(v.as_str().to_owned())),
        AMQPValue::LongString(v) => Some(HeaderValue::Str(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        AMQPValue::FieldArray(arr) => Some(HeaderValue::List(
            arr.as_slice().iter().filter_map(from_amqp_value).collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_values_survive_the_field_table_conversion() {
        let mut headers = Headers::default();
        headers.insert("x-timeout".to_owned(), HeaderValue::Int(150));
        headers.insert("x-persist".to_owned(), HeaderValue::Bool(true));
        headers.insert("x-correlation-id".to_owned(), HeaderValue::from("abc"));
        headers.insert(
            "x-breadcrumbs".to_owned(),
            HeaderValue::List(vec!["a".into(), "b".into()]),
        );

        assert_eq!(from_field_table(&to_field_table(&headers)), headers);
    }

    #[test]
    fn narrow_integers_widen_to_i64() {
        assert_eq!(
            from_amqp_value(&AMQPValue::ShortInt(-3)),
            Some(HeaderValue::Int(-3))
        );
        assert_eq!(
            from_amqp_value(&AMQPValue::LongUInt(7)),
            Some(HeaderValue::Int(7))
        );
    }

    #[test]
    fn properties_map_both_ways() {
        let props = NativeProperties {
            content_type: Some("application/json".to_owned()),
            correlation_id: Some("abc".to_owned()),
            reply_to: Some(":amq.gen-1".to_owned()),
            kind: Some("boo".to_owned()),
            timestamp: Some(42),
            delivery_mode: Some(2),
            ..NativeProperties::default()
        };

        assert_eq!(from_basic_properties(&to_basic_properties(props.clone())), props);
    }
}
