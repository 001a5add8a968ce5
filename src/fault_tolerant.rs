// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fault Tolerant Producer
//!
//! Sends a message through the producers of one label, moving on to the next
//! producer picked by the selector whenever an attempt fails.

use crate::{
    errors::BusError, label::MessageLabel, message::Message, selector::ProducerSelector,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// An outgoing message and, for requests, the response it got.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageExchange {
    pub out: Message,
    pub expected_response: Option<MessageLabel>,
    pub inbound: Option<Message>,
}

impl MessageExchange {
    pub fn publish(out: Message) -> MessageExchange {
        MessageExchange {
            out,
            expected_response: None,
            inbound: None,
        }
    }

    pub fn request(out: Message, expected: MessageLabel) -> MessageExchange {
        MessageExchange {
            out,
            expected_response: Some(expected),
            inbound: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.expected_response.is_some()
    }
}

pub struct FaultTolerantProducer {
    label: MessageLabel,
    selector: Arc<dyn ProducerSelector>,
    attempts: usize,
}

impl FaultTolerantProducer {
    pub fn new(
        label: MessageLabel,
        selector: Arc<dyn ProducerSelector>,
        attempts: usize,
    ) -> FaultTolerantProducer {
        FaultTolerantProducer {
            label,
            selector,
            attempts: attempts.max(1),
        }
    }

    pub fn label(&self) -> &MessageLabel {
        &self.label
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn selector(&self) -> &Arc<dyn ProducerSelector> {
        &self.selector
    }

    /// Sends the exchange, trying up to `attempts` producers. Requests come
    /// back with their response in `inbound`.
    pub async fn try_send(
        &self,
        mut exchange: MessageExchange,
    ) -> Result<MessageExchange, BusError> {
        let mut errors = Vec::with_capacity(self.attempts);

        for attempt in 1..=self.attempts {
            let sender = self.selector.next()?;

            let sent = match &exchange.expected_response {
                Some(expected) => sender
                    .request(exchange.out.clone(), expected.clone())
                    .await
                    .map(Some),
                None => sender.publish(exchange.out.clone()).await.map(|_| None),
            };

            match sent {
                Ok(inbound) => {
                    debug!(
                        label = %self.label,
                        attempt,
                        key = %sender.connection_key(),
                        "message sent"
                    );
                    exchange.inbound = inbound;
                    return Ok(exchange);
                }
                Err(err) => {
                    warn!(
                        label = %self.label,
                        attempt,
                        key = %sender.connection_key(),
                        error = err.to_string(),
                        "failure to send message"
                    );
                    errors.push(err);
                }
            }
        }

        Err(BusError::AttemptsExhausted {
            attempts: self.attempts,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        producer::{MessageSender, MockMessageSender},
        selector::RoundRobinSelector,
    };
    use serde_json::json;

    fn message() -> Message {
        Message::new(MessageLabel::new("boo"), json!({"num": 1}))
    }

    fn failing(key: &str) -> MockMessageSender {
        let mut sender = MockMessageSender::new();
        sender.expect_connection_key().return_const(key.to_owned());
        sender
            .expect_publish()
            .times(1)
            .returning(|_| Err(BusError::ChannelShutdown("gone".to_owned())));
        sender
    }

    #[tokio::test]
    async fn moves_on_to_the_next_producer_after_a_failure() {
        let mut healthy = MockMessageSender::new();
        healthy.expect_connection_key().return_const("b".to_owned());
        healthy.expect_publish().times(1).returning(|_| Ok(()));

        let senders: Vec<Arc<dyn MessageSender>> = vec![Arc::new(failing("a")), Arc::new(healthy)];
        let producer = FaultTolerantProducer::new(
            MessageLabel::new("boo"),
            Arc::new(RoundRobinSelector::new(senders)),
            2,
        );

        let sent = producer.try_send(MessageExchange::publish(message())).await.unwrap();
        assert_eq!(sent.inbound, None);
    }

    #[tokio::test]
    async fn exhausted_attempts_report_every_error() {
        let senders: Vec<Arc<dyn MessageSender>> =
            vec![Arc::new(failing("a")), Arc::new(failing("b"))];
        let producer = FaultTolerantProducer::new(
            MessageLabel::new("boo"),
            Arc::new(RoundRobinSelector::new(senders)),
            2,
        );

        let result = producer.try_send(MessageExchange::publish(message())).await;

        assert_eq!(
            result,
            Err(BusError::AttemptsExhausted {
                attempts: 2,
                errors: vec![
                    BusError::ChannelShutdown("gone".to_owned()),
                    BusError::ChannelShutdown("gone".to_owned())
                ]
            })
        );
    }

    #[tokio::test]
    async fn requests_carry_the_response_back() {
        let mut sender = MockMessageSender::new();
        sender.expect_connection_key().return_const("a".to_owned());
        sender
            .expect_request()
            .withf(|_, expected| expected == &MessageLabel::new("boo.result"))
            .times(1)
            .returning(|_, expected| Ok(Message::new(expected, json!({"num": 2}))));

        let senders: Vec<Arc<dyn MessageSender>> = vec![Arc::new(sender)];
        let producer = FaultTolerantProducer::new(
            MessageLabel::new("boo"),
            Arc::new(RoundRobinSelector::new(senders)),
            1,
        );

        let exchange = MessageExchange::request(message(), MessageLabel::new("boo.result"));
        assert!(exchange.is_request());
        let sent = producer.try_send(exchange).await.unwrap();

        assert_eq!(sent.inbound.map(|m| m.payload), Some(json!({"num": 2})));
    }

    #[tokio::test]
    async fn no_producers_fails_without_attempting() {
        let producer = FaultTolerantProducer::new(
            MessageLabel::new("boo"),
            Arc::new(RoundRobinSelector::default()),
            3,
        );

        assert_eq!(
            producer.try_send(MessageExchange::publish(message())).await,
            Err(BusError::NoProducers)
        );
    }

    #[test]
    fn at_least_one_attempt_is_made() {
        let producer = FaultTolerantProducer::new(
            MessageLabel::new("boo"),
            Arc::new(RoundRobinSelector::default()),
            0,
        );
        assert_eq!(producer.attempts(), 1);
    }
}
