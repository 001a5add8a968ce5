// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer Selectors
//!
//! Selectors spread sends over the producers of one label, one producer per
//! broker URL. Members are kept in insertion order and the cursor is taken
//! modulo the current length, so producers added while others iterate are
//! reached on the next cycle.

use crate::{errors::BusError, producer::MessageSender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub trait ProducerSelector: Send + Sync {
    /// Returns the next producer to send through.
    fn next(&self) -> Result<Arc<dyn MessageSender>, BusError>;

    /// Returns the producer connected through `key`.
    fn pick_by_connection_key(&self, key: &str) -> Result<Arc<dyn MessageSender>, BusError>;

    fn add(&self, sender: Arc<dyn MessageSender>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct Members {
    senders: Vec<Arc<dyn MessageSender>>,
    cursor: usize,
}

impl Members {
    fn pick_by_connection_key(&self, key: &str) -> Result<Arc<dyn MessageSender>, BusError> {
        self.senders
            .iter()
            .find(|sender| sender.connection_key() == key)
            .cloned()
            .ok_or(BusError::NoProducers)
    }
}

/// Cycles through producers in order.
#[derive(Default)]
pub struct RoundRobinSelector {
    members: Mutex<Members>,
}

impl RoundRobinSelector {
    pub fn new(senders: Vec<Arc<dyn MessageSender>>) -> RoundRobinSelector {
        RoundRobinSelector {
            members: Mutex::new(Members { senders, cursor: 0 }),
        }
    }
}

impl ProducerSelector for RoundRobinSelector {
    fn next(&self) -> Result<Arc<dyn MessageSender>, BusError> {
        let mut members = self.members.lock();
        if members.senders.is_empty() {
            return Err(BusError::NoProducers);
        }

        let index = members.cursor % members.senders.len();
        members.cursor = index + 1;
        Ok(members.senders[index].clone())
    }

    fn pick_by_connection_key(&self, key: &str) -> Result<Arc<dyn MessageSender>, BusError> {
        self.members.lock().pick_by_connection_key(key)
    }

    fn add(&self, sender: Arc<dyn MessageSender>) {
        self.members.lock().senders.push(sender);
    }

    fn len(&self) -> usize {
        self.members.lock().senders.len()
    }
}

/// Cycles through healthy producers. When none is healthy it returns the
/// producer under the cursor.
#[derive(Default)]
pub struct GoodConditionSelector {
    members: Mutex<Members>,
}

impl GoodConditionSelector {
    pub fn new(senders: Vec<Arc<dyn MessageSender>>) -> GoodConditionSelector {
        GoodConditionSelector {
            members: Mutex::new(Members { senders, cursor: 0 }),
        }
    }
}

impl ProducerSelector for GoodConditionSelector {
    fn next(&self) -> Result<Arc<dyn MessageSender>, BusError> {
        let mut members = self.members.lock();
        let len = members.senders.len();
        if len == 0 {
            return Err(BusError::NoProducers);
        }

        let start = members.cursor % len;
        let healthy = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|index| members.senders[*index].is_healthy());
        let index = healthy.unwrap_or(start);

        members.cursor = index + 1;
        Ok(members.senders[index].clone())
    }

    fn pick_by_connection_key(&self, key: &str) -> Result<Arc<dyn MessageSender>, BusError> {
        self.members.lock().pick_by_connection_key(key)
    }

    fn add(&self, sender: Arc<dyn MessageSender>) {
        self.members.lock().senders.push(sender);
    }

    fn len(&self) -> usize {
        self.members.lock().senders.len()
    }
}

/// Builds the selector of a sender's producers.
pub trait ProducerSelectorBuilder: Send + Sync {
    fn build(&self, senders: Vec<Arc<dyn MessageSender>>) -> Arc<dyn ProducerSelector>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    RoundRobin,
    GoodCondition,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProducerSelectorBuilder {
    kind: SelectorKind,
}

impl DefaultProducerSelectorBuilder {
    pub fn new(kind: SelectorKind) -> DefaultProducerSelectorBuilder {
        DefaultProducerSelectorBuilder { kind }
    }
}

impl ProducerSelectorBuilder for DefaultProducerSelectorBuilder {
    fn build(&self, senders: Vec<Arc<dyn MessageSender>>) -> Arc<dyn ProducerSelector> {
        match self.kind {
            SelectorKind::RoundRobin => Arc::new(RoundRobinSelector::new(senders)),
            SelectorKind::GoodCondition => Arc::new(GoodConditionSelector::new(senders)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::MockMessageSender;

    fn sender(key: &str, healthy: bool) -> Arc<dyn MessageSender> {
        let mut sender = MockMessageSender::new();
        sender.expect_connection_key().return_const(key.to_owned());
        sender.expect_is_healthy().return_const(healthy);
        Arc::new(sender)
    }

    fn keys(selector: &dyn ProducerSelector, calls: usize) -> Vec<String> {
        (0..calls)
            .map(|_| selector.next().unwrap().connection_key())
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let selector = RoundRobinSelector::new(vec![
            sender("a", true),
            sender("b", true),
            sender("c", true),
        ]);

        assert_eq!(keys(&selector, 7), vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn round_robin_reaches_producers_added_later() {
        let selector = RoundRobinSelector::new(vec![sender("a", true), sender("b", true)]);
        assert_eq!(keys(&selector, 1), vec!["a"]);

        selector.add(sender("c", true));

        assert_eq!(keys(&selector, 4), vec!["b", "c", "a", "b"]);
    }

    #[test]
    fn good_condition_always_picks_the_only_healthy_producer() {
        let selector = GoodConditionSelector::new(vec![
            sender("a", false),
            sender("b", true),
            sender("c", false),
        ]);

        assert_eq!(keys(&selector, 5), vec!["b"; 5]);
    }

    #[test]
    fn good_condition_falls_back_to_cursor_when_none_is_healthy() {
        let selector = GoodConditionSelector::new(vec![sender("a", false), sender("b", false)]);
        assert_eq!(keys(&selector, 3), vec!["a", "b", "a"]);
    }

    #[test]
    fn empty_selectors_fail_explicitly() {
        assert!(matches!(RoundRobinSelector::default().next(), Err(BusError::NoProducers)));
        assert!(matches!(GoodConditionSelector::default().next(), Err(BusError::NoProducers)));
    }

    #[test]
    fn picks_by_connection_key() {
        let selector = DefaultProducerSelectorBuilder::default()
            .build(vec![sender("amqp://a", true), sender("amqp://b", true)]);

        assert_eq!(
            selector.pick_by_connection_key("amqp://b").unwrap().connection_key(),
            "amqp://b"
        );
        assert!(matches!(
            selector.pick_by_connection_key("amqp://z"),
            Err(BusError::NoProducers)
        ));
    }
}
