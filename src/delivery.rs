// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A `Delivery` is one inbound occurrence of a message at a consumer. It keeps
//! the channel it arrived on so it can be accepted, rejected or replied to.
//! Settling is guarded so the broker hears about a delivery exactly once.

use crate::{
    channel::Channel,
    converter::PayloadConverter,
    errors::BusError,
    label::MessageLabel,
    message::{
        HeaderValue, Headers, Message, HEADER_CORRELATION_ID, HEADER_MESSAGE_LABEL,
        HEADER_REPLY_ROUTE,
    },
    route::Route,
    transport::NativeDelivery,
};
use serde::de::DeserializeOwned;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};
use tracing::warn;

/// An inbound message occurrence.
pub struct Delivery {
    channel: Arc<Channel>,
    native: NativeDelivery,
    accept_required: bool,
    converter: Arc<dyn PayloadConverter>,
    headers: OnceLock<Headers>,
    settled: AtomicBool,
}

impl Delivery {
    pub(crate) fn new(
        channel: Arc<Channel>,
        native: NativeDelivery,
        accept_required: bool,
        converter: Arc<dyn PayloadConverter>,
    ) -> Delivery {
        Delivery {
            channel,
            native,
            accept_required,
            converter,
            headers: OnceLock::new(),
            settled: AtomicBool::new(false),
        }
    }

    /// Message headers merged with the correlation id and reply route carried
    /// in the transport properties. Computed once.
    pub fn headers(&self) -> &Headers {
        self.headers.get_or_init(|| {
            let props = &self.native.properties;
            let mut headers = props.headers.clone();

            if let Some(correlation_id) = &props.correlation_id {
                headers
                    .entry(HEADER_CORRELATION_ID.to_owned())
                    .or_insert_with(|| HeaderValue::from(correlation_id.as_str()));
            }
            if let Some(reply_to) = &props.reply_to {
                headers
                    .entry(HEADER_REPLY_ROUTE.to_owned())
                    .or_insert_with(|| HeaderValue::from(reply_to.as_str()));
            }

            headers
        })
    }

    /// The label from the message label header, falling back to the type property.
    pub fn label(&self) -> MessageLabel {
        self.headers()
            .get(HEADER_MESSAGE_LABEL)
            .and_then(HeaderValue::as_str)
            .or(self.native.properties.kind.as_deref())
            .filter(|name| !name.is_empty())
            .map(MessageLabel::new)
            .unwrap_or_default()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers()
            .get(HEADER_CORRELATION_ID)
            .and_then(HeaderValue::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Where a response to this delivery must be published, if anywhere.
    pub fn reply_route(&self) -> Option<Route> {
        self.headers()
            .get(HEADER_REPLY_ROUTE)
            .and_then(HeaderValue::as_str)
            .filter(|route| !route.is_empty())
            .and_then(|route| route.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.native.properties.content_type.as_deref()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.native.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.native.redelivered
    }

    pub fn body(&self) -> &[u8] {
        &self.native.body
    }

    pub fn accept_required(&self) -> bool {
        self.accept_required
    }

    pub fn payload(&self) -> Result<serde_json::Value, BusError> {
        self.converter.to_object(&self.native.body)
    }

    /// Decodes the payload into a concrete type.
    pub fn unpack_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.payload()?)
            .map_err(|err| BusError::ParsePayloadError(err.to_string()))
    }

    /// Decodes the delivery into a message carrying `label`.
    pub fn to_message(&self, label: MessageLabel) -> Result<Message, BusError> {
        Ok(Message::new(label, self.payload()?).with_headers(self.headers().clone()))
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acknowledges the delivery. No-op when acknowledgements are not required
    /// or the delivery was already settled.
    pub async fn accept(&self) -> Result<(), BusError> {
        if !self.accept_required || self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.accept(self.native.delivery_tag).await
    }

    /// Rejects the delivery, optionally returning it to its queue.
    pub async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        if !self.accept_required || self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.reject(self.native.delivery_tag, requeue).await
    }

    /// Publishes `message` to the reply route of this delivery, correlated with it.
    pub async fn reply_with(&self, message: Message) -> Result<(), BusError> {
        let Some(route) = self.reply_route() else {
            warn!(label = %self.label(), "reply requested for a delivery without reply route");
            return Err(BusError::MissingReplyRoute);
        };

        let mut message = message;
        message.headers.remove(HEADER_REPLY_ROUTE);
        if let Some(correlation_id) = self.correlation_id() {
            message
                .headers
                .insert(HEADER_CORRELATION_ID.to_owned(), correlation_id.into());
        }

        self.channel
            .publish(&route, &message, self.converter.as_ref(), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        converter::JsonPayloadConverter,
        transport::{memory::InMemoryBroker, NativeProperties, Transport},
    };
    use serde_json::json;

    async fn consumed(broker: &InMemoryBroker, props: NativeProperties, body: &[u8]) -> Delivery {
        broker.declare_queue("q");
        let conn = broker.connect("mem://", "test").await.unwrap();
        let channel = Channel::new(conn.create_channel().await.unwrap());
        let mut rx = channel.start_consuming("q", "tag", true).await.unwrap();
        broker.inject(&Route::to_queue("q"), props, body);
        let native = rx.recv().await.unwrap();
        Delivery::new(channel, native, true, Arc::new(JsonPayloadConverter))
    }

    #[tokio::test]
    async fn derives_headers_from_properties() {
        let broker = InMemoryBroker::new();
        let props = NativeProperties {
            correlation_id: Some("c-7".to_owned()),
            reply_to: Some(":amq.gen-x".to_owned()),
            kind: Some("boo".to_owned()),
            ..NativeProperties::default()
        };
        let delivery = consumed(&broker, props, br#"{"num":3}"#).await;

        assert_eq!(delivery.label(), MessageLabel::new("boo"));
        assert_eq!(delivery.correlation_id(), Some("c-7"));
        assert_eq!(delivery.reply_route(), Some(Route::to_queue("amq.gen-x")));
        assert_eq!(delivery.payload().unwrap(), json!({"num": 3}));
    }

    #[tokio::test]
    async fn settles_exactly_once() {
        let broker = InMemoryBroker::new();
        let delivery = consumed(&broker, NativeProperties::default(), b"{}").await;
        assert_eq!(broker.unacked("q"), 1);

        delivery.accept().await.unwrap();
        delivery.reject(true).await.unwrap();

        assert!(delivery.is_settled());
        assert_eq!(broker.unacked("q"), 0);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn replies_to_the_reply_route_with_correlation_id() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("replies");
        let props = NativeProperties {
            correlation_id: Some("c-1".to_owned()),
            reply_to: Some(":replies".to_owned()),
            ..NativeProperties::default()
        };
        let delivery = consumed(&broker, props, b"{}").await;

        delivery
            .reply_with(Message::new(MessageLabel::new("boo.result"), json!({"ok": true})))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("replies"), 1);
    }

    #[tokio::test]
    async fn reply_without_route_fails() {
        let broker = InMemoryBroker::new();
        let delivery = consumed(&broker, NativeProperties::default(), b"{}").await;

        assert_eq!(
            delivery.reply_with(Message::new(MessageLabel::new("x"), json!(null))).await,
            Err(BusError::MissingReplyRoute)
        );
    }
}
