// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel
//!
//! A single multiplexed session on a connection. Native channels are not safe
//! to drive from several tasks at once, so every broker operation goes through
//! `invoke`, which holds the channel lock for the whole native call. Operations
//! submitted by one caller therefore reach the broker in submission order.
//!
//! The channel raises its shutdown event exactly once, whether the broker or
//! the client closed it. Confirmation trackers and producers subscribe to it to
//! fail in-flight work instead of hanging.

use crate::{
    confirmation::{ConfirmationFuture, PublishConfirmationTracker},
    converter::PayloadConverter,
    errors::BusError,
    exchange::ExchangeDefinition,
    message::{Message, HEADER_MESSAGE_LABEL, HEADER_REPLY_ROUTE},
    otel,
    queue::{QueueBinding, QueueDefinition},
    route::Route,
    transport::{DeliveryReceiver, NativeChannel, NativeProperties},
};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error};
use uuid::Uuid;

/// AMQP delivery mode of persistent messages.
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

type ShutdownListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Amends the native properties of a message right before it is published.
pub type PropertiesVisitor<'a> = &'a (dyn Fn(&mut NativeProperties) + Send + Sync);

/// A serialized session on a broker connection.
pub struct Channel {
    native: Arc<dyn NativeChannel>,
    lock: tokio::sync::Mutex<()>,
    shut_down: AtomicBool,
    shutdown_reason: Mutex<Option<String>>,
    listeners: Mutex<Vec<ShutdownListener>>,
}

impl Channel {
    pub(crate) fn new(native: Arc<dyn NativeChannel>) -> Arc<Channel> {
        let channel = Arc::new(Channel {
            native,
            lock: tokio::sync::Mutex::new(()),
            shut_down: AtomicBool::new(false),
            shutdown_reason: Mutex::new(None),
            listeners: Mutex::new(vec![]),
        });

        let weak = Arc::downgrade(&channel);
        channel.native.on_shutdown(Box::new(move |reason| {
            if let Some(channel) = weak.upgrade() {
                channel.raise_shutdown(&reason);
            }
        }));

        channel
    }

    pub fn is_open(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst) && self.native.is_open()
    }

    /// Subscribes to the shutdown event. Fires immediately if the channel is already shut down.
    pub fn on_shutdown<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let handler: ShutdownListener = Arc::new(handler);
        let already = {
            let mut listeners = self.listeners.lock();
            if self.shut_down.load(Ordering::SeqCst) {
                self.shutdown_reason.lock().clone()
            } else {
                listeners.push(handler.clone());
                None
            }
        };

        if let Some(reason) = already {
            handler(&reason);
        }
    }

    fn raise_shutdown(&self, reason: &str) {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if self.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            *self.shutdown_reason.lock() = Some(reason.to_owned());
            std::mem::take(&mut *listeners)
        };

        debug!(reason, "channel shut down");
        for listener in listeners {
            listener(reason);
        }
    }

    /// Runs a native operation under the channel lock. Failures are logged and
    /// returned; a failure that left the native channel closed raises shutdown.
    async fn invoke<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, BusError>
    where
        F: FnOnce(Arc<dyn NativeChannel>) -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ChannelShutdown(
                self.shutdown_reason.lock().clone().unwrap_or_default(),
            ));
        }

        let result = {
            let _guard = self.lock.lock().await;
            f(self.native.clone()).await
        };

        if let Err(err) = &result {
            error!(operation, error = err.to_string(), "channel operation failed");
            if !self.native.is_open() {
                self.raise_shutdown(&err.to_string());
            }
        }

        result
    }

    /// Publishes a message without tracking its confirmation.
    pub async fn publish(
        &self,
        route: &Route,
        message: &Message,
        converter: &dyn PayloadConverter,
        visitor: Option<PropertiesVisitor<'_>>,
    ) -> Result<(), BusError> {
        let body = converter.from_object(&message.payload)?;
        let properties = build_properties(message, converter.content_type(), visitor);

        self.invoke("publish", |native| async move {
            native
                .basic_publish(&route.exchange, &route.routing_key, &body, properties)
                .await
        })
        .await
    }

    /// Publishes a message and registers it with `tracker`. Reserving the
    /// sequence number, tracking it and publishing happen under one lock
    /// acquisition, so sequence numbers always line up with their publishes.
    pub async fn publish_tracked(
        &self,
        route: &Route,
        message: &Message,
        converter: &dyn PayloadConverter,
        tracker: &dyn PublishConfirmationTracker,
        visitor: Option<PropertiesVisitor<'_>>,
    ) -> Result<ConfirmationFuture, BusError> {
        let body = converter.from_object(&message.payload)?;
        let properties = build_properties(message, converter.content_type(), visitor);

        self.invoke("publish", |native| async move {
            let seq_no = native.next_publish_seq_no();
            let confirmation = tracker.track(seq_no);

            match native
                .basic_publish(&route.exchange, &route.routing_key, &body, properties)
                .await
            {
                Ok(()) => Ok(confirmation),
                Err(err) => {
                    tracker.forget(seq_no, err.clone());
                    Err(err)
                }
            }
        })
        .await
    }

    pub async fn accept(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.invoke("ack", |native| async move { native.basic_ack(delivery_tag).await })
            .await
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        self.invoke("reject", |native| async move {
            native.basic_reject(delivery_tag, requeue).await
        })
        .await
    }

    pub async fn set_qos(&self, prefetch_count: u16) -> Result<(), BusError> {
        self.invoke("qos", |native| async move { native.basic_qos(prefetch_count).await })
            .await
    }

    /// Puts the channel in publisher confirm mode.
    pub async fn enable_publish_confirmation(&self) -> Result<(), BusError> {
        self.invoke("confirm_select", |native| async move {
            native.confirm_select().await
        })
        .await
    }

    /// Routes broker confirms as `(confirmed, seq_no, multiple)` to `handler`.
    pub fn on_confirmation<F>(&self, handler: F)
    where
        F: Fn(bool, u64, bool) + Send + Sync + 'static,
    {
        self.native.on_confirmation(Arc::new(handler));
    }

    /// Registers a consumer on `queue`. Deliveries need acknowledgement only
    /// when `accept_required` is set.
    pub async fn start_consuming(
        &self,
        queue: &str,
        consumer_tag: &str,
        accept_required: bool,
    ) -> Result<DeliveryReceiver, BusError> {
        self.invoke("consume", |native| async move {
            native
                .basic_consume(queue, consumer_tag, !accept_required)
                .await
        })
        .await
    }

    pub async fn stop_consuming(&self, consumer_tag: &str) -> Result<(), BusError> {
        self.invoke("cancel", |native| async move {
            native.basic_cancel(consumer_tag).await
        })
        .await
    }

    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        debug!(name = def.name(), "declaring exchange");
        self.invoke("exchange_declare", |native| async move {
            native.exchange_declare(def).await
        })
        .await
    }

    /// Declares the queue together with its retry and dead letter companions.
    /// Returns the effective queue name.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, BusError> {
        debug!(name = def.name(), "declaring queue");
        self.invoke("queue_declare", |native| async move {
            for (name, args) in def.companions() {
                native.queue_declare(&name, def, args).await?;
            }
            native.queue_declare(&def.name, def, def.arguments()).await
        })
        .await
    }

    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.invoke("queue_bind", |native| async move {
            native.queue_bind(binding).await
        })
        .await
    }

    /// Closes the channel. Idempotent.
    pub async fn close(&self) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        {
            let _guard = self.lock.lock().await;
            if let Err(err) = self.native.close().await {
                debug!(error = err.to_string(), "channel was already closed");
            }
        }

        self.raise_shutdown("closed by client");
    }
}

fn build_properties(
    message: &Message,
    content_type: &str,
    visitor: Option<PropertiesVisitor<'_>>,
) -> NativeProperties {
    let mut headers = message.headers.clone();
    headers.insert(
        HEADER_MESSAGE_LABEL.to_owned(),
        message.label.name().into(),
    );
    otel::inject_current(&mut headers);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut properties = NativeProperties {
        content_type: Some(content_type.to_owned()),
        message_id: Some(Uuid::new_v4().to_string()),
        correlation_id: message.correlation_id().map(str::to_owned),
        reply_to: message
            .header(HEADER_REPLY_ROUTE)
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        kind: Some(message.label.name().to_owned()),
        timestamp: Some(timestamp),
        expiration: message.ttl().map(|ttl| ttl.as_millis().to_string()),
        delivery_mode: Some(if message.persist() {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        }),
        headers,
    };

    if let Some(visitor) = visitor {
        visitor(&mut properties);
    }

    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        confirmation::DefaultPublishConfirmationTracker,
        converter::JsonPayloadConverter,
        label::MessageLabel,
        message::{HEADER_CORRELATION_ID, HEADER_PERSIST, HEADER_TTL},
        transport::{memory::InMemoryBroker, Transport},
    };
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn channel(broker: &InMemoryBroker) -> Arc<Channel> {
        let conn = broker.connect("mem://", "test").await.unwrap();
        Channel::new(conn.create_channel().await.unwrap())
    }

    #[test]
    fn properties_reflect_message_headers() {
        let message = Message::new(MessageLabel::new("boo"), json!({}))
            .with_header(HEADER_CORRELATION_ID, "c-1")
            .with_header(HEADER_REPLY_ROUTE, ":amq.gen-1")
            .with_header(HEADER_TTL, 1500_i64)
            .with_header(HEADER_PERSIST, true);

        let visitor = |props: &mut NativeProperties| props.kind = Some("visited".to_owned());
        let props = build_properties(&message, "application/json", Some(&visitor));

        assert_eq!(props.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(props.reply_to.as_deref(), Some(":amq.gen-1"));
        assert_eq!(props.expiration.as_deref(), Some("1500"));
        assert_eq!(props.delivery_mode, Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(props.kind.as_deref(), Some("visited"));
        assert_eq!(
            props.headers.get(HEADER_MESSAGE_LABEL).and_then(|v| v.as_str()),
            Some("boo")
        );
    }

    #[tokio::test]
    async fn tracked_publish_resolves_on_broker_confirm() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let channel = channel(&broker).await;
        let tracker = Arc::new(DefaultPublishConfirmationTracker::new());

        channel.enable_publish_confirmation().await.unwrap();
        let handler = tracker.clone();
        channel.on_confirmation(move |ok, seq, multiple| {
            handler.handle_confirmation(ok, seq, multiple)
        });

        let message = Message::new(MessageLabel::new("boo"), json!({"n": 1}));
        let confirmation = channel
            .publish_tracked(
                &Route::to_queue("q"),
                &message,
                &JsonPayloadConverter,
                tracker.as_ref(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(confirmation.await, Ok(()));
        assert_eq!(tracker.pending(), 0);
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn failed_publish_does_not_leave_pending_confirmations() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let tracker = DefaultPublishConfirmationTracker::new();
        channel.enable_publish_confirmation().await.unwrap();

        let message = Message::new(MessageLabel::new("boo"), json!({}));
        let result = channel
            .publish_tracked(
                &Route::new("missing", ""),
                &message,
                &JsonPayloadConverter,
                &tracker,
                None,
            )
            .await;

        assert!(matches!(result, Err(BusError::PublishingError(_))));
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn shutdown_fires_once_and_late_subscribers_are_notified() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        channel.on_shutdown(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.close().await;
        channel.close().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!channel.is_open());

        let counter = fired.clone();
        channel.on_shutdown(move |reason| {
            assert_eq!(reason, "closed by client");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broker_shutdown_is_raised_to_subscribers() {
        let broker = InMemoryBroker::new();
        // the broker only tracks live connections, so keep ours alive
        let conn = broker.connect("mem://", "test").await.unwrap();
        let channel = Channel::new(conn.create_channel().await.unwrap());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        channel.on_shutdown(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        broker.sever_connections("gone");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let message = Message::new(MessageLabel::new("boo"), json!({}));
        assert!(matches!(
            channel.publish(&Route::to_queue("q"), &message, &JsonPayloadConverter, None).await,
            Err(BusError::ChannelShutdown(_))
        ));
    }

    #[tokio::test]
    async fn declares_queue_with_companions() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        let name = channel
            .declare_queue(&QueueDefinition::new("orders").with_dlq().with_retry(100))
            .await
            .unwrap();

        assert_eq!(name, "orders");
        assert!(broker.has_queue("orders-dlq"));
        assert!(broker.has_queue("orders-retry"));
    }
}
