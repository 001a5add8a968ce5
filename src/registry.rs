// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener and Producer Registries
//!
//! This module keeps track of the listeners and producers a bus runs. Receivers
//! configured for the same queue on the same broker share one listener, and
//! senders share one producer per label and broker URL. Registries start and
//! stop their members as a group.

use crate::{
    config::{ReceiverOptions, SenderOptions},
    errors::BusError,
    label::MessageLabel,
    listener::{DeliveryHandling, Listener, ListeningSource},
    pool::ConnectionPool,
    producer::{Producer, SenderHandling},
    route::Endpoint,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::debug;

/// Registry of the listeners of a bus.
pub struct ListenerRegistry {
    pool: Arc<ConnectionPool>,
    timer_resolution: Duration,
    shared: Mutex<HashMap<(String, String), Arc<Listener>>>,
    callbacks: Mutex<Vec<Arc<Listener>>>,
}

impl ListenerRegistry {
    pub fn new(pool: Arc<ConnectionPool>, timer_resolution: Duration) -> ListenerRegistry {
        ListenerRegistry {
            pool,
            timer_resolution,
            shared: Mutex::new(HashMap::default()),
            callbacks: Mutex::new(vec![]),
        }
    }

    /// Returns the listener consuming `queue` on `url`, creating it on first use.
    ///
    /// # Parameters
    /// * `url` - Broker URL
    /// * `queue` - Name of the consumed queue
    /// * `options` - Options of the receiver asking for the listener
    /// * `handling` - Collaborators used when the listener is created
    ///
    /// # Returns
    /// The shared listener, or `IncompatibleListener` when an existing listener
    /// was created with options the receiver cannot share
    pub fn resolve(
        &self,
        url: &str,
        queue: &str,
        options: &ReceiverOptions,
        handling: &DeliveryHandling,
    ) -> Result<Arc<Listener>, BusError> {
        let mut shared = self.shared.lock();
        let key = (url.to_owned(), queue.to_owned());

        if let Some(existing) = shared.get(&key) {
            existing.check_compatible(options, &handling.failed)?;
            return Ok(existing.clone());
        }

        let listener = Listener::new(
            self.pool.clone(),
            url,
            ListeningSource::Queue(queue.to_owned()),
            options.clone(),
            handling.clone(),
            self.timer_resolution,
        );
        debug!(url, queue, "listener registered");
        shared.insert(key, listener.clone());

        Ok(listener)
    }

    /// Creates a callback listener. Callback listeners are never shared.
    pub fn resolve_callback(
        &self,
        url: &str,
        options: &ReceiverOptions,
        handling: &DeliveryHandling,
    ) -> Arc<Listener> {
        let listener = Listener::new(
            self.pool.clone(),
            url,
            ListeningSource::Callback,
            options.clone(),
            handling.clone(),
            self.timer_resolution,
        );
        self.callbacks.lock().push(listener.clone());
        listener
    }

    /// Listeners consuming named queues.
    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.shared.lock().values().cloned().collect()
    }

    pub fn callback_listeners(&self) -> Vec<Arc<Listener>> {
        self.callbacks.lock().clone()
    }

    /// Starts every listener consuming a named queue. Callback listeners are
    /// started by the producers owning them.
    pub async fn start_all(&self) -> Result<(), BusError> {
        let listeners = self.listeners();
        join_all(listeners.iter().map(|listener| listener.start_consuming()))
            .await
            .into_iter()
            .collect()
    }

    /// Stops every listener, callback listeners included.
    pub async fn stop_all(&self) {
        let listeners: Vec<Arc<Listener>> = self
            .listeners()
            .into_iter()
            .chain(self.callback_listeners())
            .collect();
        join_all(listeners.iter().map(|listener| listener.stop_consuming())).await;
    }

    pub fn clear(&self) {
        self.shared.lock().clear();
        self.callbacks.lock().clear();
    }
}

/// Registry of the producers of a bus.
pub struct ProducerRegistry {
    pool: Arc<ConnectionPool>,
    producers: Mutex<HashMap<(MessageLabel, String), Arc<Producer>>>,
}

impl ProducerRegistry {
    pub fn new(pool: Arc<ConnectionPool>) -> ProducerRegistry {
        ProducerRegistry {
            pool,
            producers: Mutex::new(HashMap::default()),
        }
    }

    /// Returns the producer of `label` on the endpoint's URL, creating it on first use.
    /// The second return value tells whether the producer was just created.
    pub fn resolve(
        &self,
        label: &MessageLabel,
        endpoint: &Endpoint,
        options: &SenderOptions,
        handling: &SenderHandling,
    ) -> (Arc<Producer>, bool) {
        let mut producers = self.producers.lock();
        let key = (label.clone(), endpoint.url.clone());

        if let Some(existing) = producers.get(&key) {
            return (existing.clone(), false);
        }

        let producer = Producer::new(
            label.clone(),
            endpoint.clone(),
            options.clone(),
            handling.clone(),
            self.pool.clone(),
        );
        debug!(label = %label, url = %endpoint.url, "producer registered");
        producers.insert(key, producer.clone());

        (producer, true)
    }

    pub fn producers(&self) -> Vec<Arc<Producer>> {
        self.producers.lock().values().cloned().collect()
    }

    pub async fn start_all(&self) -> Result<(), BusError> {
        let producers = self.producers();
        join_all(producers.iter().map(|producer| producer.start()))
            .await
            .into_iter()
            .collect()
    }

    pub async fn stop_all(&self) {
        let producers = self.producers();
        join_all(producers.iter().map(|producer| producer.stop())).await;
    }

    pub fn clear(&self) {
        self.producers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetryPolicy,
        connection::ConnectionSettings,
        strategy::{FailedDeliveryStrategy, RejectDeliveryStrategy},
        transport::memory::InMemoryBroker,
    };

    fn pool(broker: &InMemoryBroker) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            Arc::new(broker.clone()),
            ConnectionSettings {
                retry: RetryPolicy::new(Duration::from_millis(10), 10),
                ..ConnectionSettings::default()
            },
        ))
    }

    #[test]
    fn receivers_of_one_queue_share_a_listener() {
        let registry =
            ListenerRegistry::new(pool(&InMemoryBroker::new()), Duration::from_millis(50));
        let handling = DeliveryHandling::default();
        let options = ReceiverOptions::default();

        let first = registry.resolve("mem://", "q", &options, &handling).unwrap();
        let second = registry.resolve("mem://", "q", &options, &handling).unwrap();
        let other = registry.resolve("mem://", "other", &options, &handling).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.listeners().len(), 2);
    }

    #[test]
    fn incompatible_receivers_are_refused() {
        let registry =
            ListenerRegistry::new(pool(&InMemoryBroker::new()), Duration::from_millis(50));
        let handling = DeliveryHandling::default();
        registry
            .resolve("mem://", "q", &ReceiverOptions::default(), &handling)
            .unwrap();

        let requeue: Arc<dyn FailedDeliveryStrategy> = Arc::new(RejectDeliveryStrategy::requeue());
        let conflicting = DeliveryHandling {
            failed: requeue,
            ..handling.clone()
        };

        assert!(matches!(
            registry.resolve("mem://", "q", &ReceiverOptions::default(), &conflicting),
            Err(BusError::IncompatibleListener { .. })
        ));
        assert!(matches!(
            registry.resolve(
                "mem://",
                "q",
                &ReceiverOptions::default().with_parallelism_level(4),
                &handling
            ),
            Err(BusError::IncompatibleListener { .. })
        ));
    }

    #[test]
    fn callback_listeners_are_never_shared() {
        let registry =
            ListenerRegistry::new(pool(&InMemoryBroker::new()), Duration::from_millis(50));
        let handling = DeliveryHandling::default();

        let first = registry.resolve_callback("mem://", &ReceiverOptions::callback(), &handling);
        let second = registry.resolve_callback("mem://", &ReceiverOptions::callback(), &handling);

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_callback());
        assert!(registry.listeners().is_empty());
        assert_eq!(registry.callback_listeners().len(), 2);
    }

    #[test]
    fn producers_are_cached_by_label_and_url() {
        let registry = ProducerRegistry::new(pool(&InMemoryBroker::new()));
        let handling = SenderHandling::default();
        let endpoint = |url: &str| Endpoint {
            name: "test".to_owned(),
            url: url.to_owned(),
        };
        let boo = MessageLabel::new("boo");

        let options = SenderOptions::default();
        let (first, created) = registry.resolve(&boo, &endpoint("mem://a"), &options, &handling);
        assert!(created);
        let (second, created) = registry.resolve(&boo, &endpoint("mem://a"), &options, &handling);
        assert!(!created);
        let (third, _) = registry.resolve(&boo, &endpoint("mem://b"), &options, &handling);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(registry.producers().len(), 2);
    }

    #[tokio::test]
    async fn start_and_stop_all_listeners() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let registry = ListenerRegistry::new(pool(&broker), Duration::from_millis(50));
        let listener = registry
            .resolve("mem://", "q", &ReceiverOptions::default(), &DeliveryHandling::default())
            .unwrap();

        registry.start_all().await.unwrap();
        assert!(listener.is_consuming());
        for _ in 0..50 {
            if broker.consumer_count("q") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.consumer_count("q"), 1);

        registry.stop_all().await;
        assert!(!listener.is_consuming());
        assert_eq!(broker.consumer_count("q"), 0);
    }
}
