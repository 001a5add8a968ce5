// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer
//!
//! A producer publishes the messages of one label to one broker. It owns a
//! channel on a pooled connection and, when confirmations are required, one
//! confirmation tracker per channel. Requests additionally go through a
//! callback listener that receives the responses.
//!
//! When the broker drops the producer's connection the producer restarts
//! itself. Recoveries are serialized and a recovery scheduled for an earlier
//! session is ignored.

use crate::{
    channel::Channel,
    config::SenderOptions,
    confirmation::{
        DefaultPublishConfirmationTracker, NoopPublishConfirmationTracker,
        PublishConfirmationTracker,
    },
    connection::Connection,
    converter::{JsonPayloadConverter, PayloadConverter},
    errors::BusError,
    label::MessageLabel,
    listener::Listener,
    message::{
        HeaderValue, Message, HEADER_CORRELATION_ID, HEADER_PERSIST, HEADER_REPLY_ROUTE,
        HEADER_TIMEOUT, HEADER_TTL,
    },
    pool::ConnectionPool,
    route::{Endpoint, LabelRouteResolver, RouteResolver},
    storage::{HeaderStorage, NullHeaderStorage},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Something messages can be sent through.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Identifies the connection the sender publishes on.
    fn connection_key(&self) -> String;

    fn is_healthy(&self) -> bool;

    /// Publishes `message`, waiting for the broker confirmation when required.
    async fn publish(&self, message: Message) -> Result<(), BusError>;

    /// Publishes `message` and waits for its response.
    async fn request(&self, message: Message, expected: MessageLabel) -> Result<Message, BusError>;
}

/// Collaborators a producer publishes through.
#[derive(Clone)]
pub struct SenderHandling {
    pub resolver: Arc<dyn RouteResolver>,
    pub converter: Arc<dyn PayloadConverter>,
    pub header_storage: Arc<dyn HeaderStorage>,
}

impl Default for SenderHandling {
    fn default() -> Self {
        SenderHandling {
            resolver: Arc::new(LabelRouteResolver),
            converter: Arc::new(JsonPayloadConverter),
            header_storage: Arc::new(NullHeaderStorage),
        }
    }
}

struct Session {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    tracker: Arc<dyn PublishConfirmationTracker>,
}

pub struct Producer {
    this: Weak<Producer>,
    label: MessageLabel,
    endpoint: Endpoint,
    options: SenderOptions,
    handling: SenderHandling,
    pool: Arc<ConnectionPool>,
    callback: Mutex<Option<Arc<Listener>>>,
    session: tokio::sync::Mutex<Option<Session>>,
    current: RwLock<Option<(Arc<Channel>, Arc<dyn PublishConfirmationTracker>)>>,
    token: Mutex<CancellationToken>,
    running: AtomicBool,
    generation: AtomicU64,
    recovery: tokio::sync::Mutex<()>,
}

impl Producer {
    pub fn new(
        label: MessageLabel,
        endpoint: Endpoint,
        options: SenderOptions,
        handling: SenderHandling,
        pool: Arc<ConnectionPool>,
    ) -> Arc<Producer> {
        Arc::new_cyclic(|this| Producer {
            this: this.clone(),
            label,
            endpoint,
            options,
            handling,
            pool,
            callback: Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
            current: RwLock::new(None),
            token: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            recovery: tokio::sync::Mutex::new(()),
        })
    }

    pub fn label(&self) -> &MessageLabel {
        &self.label
    }

    pub fn url(&self) -> &str {
        &self.endpoint.url
    }

    /// Attaches the listener receiving responses to this producer's requests.
    pub fn use_callback_listener(&self, listener: Arc<Listener>) -> Result<(), BusError> {
        let mut callback = self.callback.lock();
        if callback.is_some() {
            error!(label = %self.label, "callback listener is already set");
            return Err(BusError::CallbackListenerAlreadySet(self.label.to_string()));
        }
        *callback = Some(listener);
        Ok(())
    }

    pub fn callback_listener(&self) -> Option<Arc<Listener>> {
        self.callback.lock().clone()
    }

    /// Opens the channel and starts the callback listener. Idempotent.
    pub async fn start(&self) -> Result<(), BusError> {
        self.running.store(true, Ordering::SeqCst);
        self.open_session().await
    }

    /// Closes the channel and stops the callback listener. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.close_session().await;

        let callback = self.callback.lock().clone();
        if let Some(listener) = callback {
            listener.stop_consuming().await;
        }
    }

    async fn open_session(&self) -> Result<(), BusError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let callback = self.callback.lock().clone();
        if let Some(listener) = callback {
            listener.start_consuming().await?;
        }

        let token = CancellationToken::new();
        *self.token.lock() = token.clone();

        let connection = self
            .pool
            .get(&self.endpoint.url, self.options.reuse_connection, &token)
            .await?;
        let channel = connection.open_channel().await?;

        let tracker: Arc<dyn PublishConfirmationTracker> = if self.options.confirmation_required {
            if let Err(err) = channel.enable_publish_confirmation().await {
                channel.close().await;
                return Err(err);
            }
            let tracker = Arc::new(DefaultPublishConfirmationTracker::new());
            let confirmations = tracker.clone();
            channel.on_confirmation(move |confirmed, seq_no, multiple| {
                confirmations.handle_confirmation(confirmed, seq_no, multiple)
            });
            let unconfirmed = tracker.clone();
            channel.on_shutdown(move |reason| unconfirmed.fail_unconfirmed(reason));
            tracker
        } else {
            Arc::new(NoopPublishConfirmationTracker)
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let producer = self.this.clone();
        let runtime = Handle::current();
        connection.on_closed(move |reason| {
            if let Some(producer) = producer.upgrade() {
                warn!(label = %producer.label, reason, "producer connection closed, recovering");
                runtime.spawn(producer.recover(generation));
            }
        });

        *self.current.write() = Some((channel.clone(), tracker.clone()));
        *session = Some(Session {
            connection,
            channel,
            tracker,
        });
        debug!(label = %self.label, url = %self.endpoint.url, generation, "producer started");

        Ok(())
    }

    async fn close_session(&self) {
        self.token.lock().cancel();

        let mut session = self.session.lock().await;
        *self.current.write() = None;
        let Some(session) = session.take() else {
            return;
        };

        session.tracker.reset();
        session.channel.close().await;
        if !self.options.reuse_connection {
            session.connection.close().await;
        }
        debug!(label = %self.label, url = %self.endpoint.url, "producer stopped");
    }

    /// Reopens the session lost with the connection of `generation`.
    fn recover(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _recovering = self.recovery.lock().await;
            let current = self.generation.load(Ordering::SeqCst);
            if current != generation || !self.running.load(Ordering::SeqCst) {
                debug!(label = %self.label, generation, "skipping stale recovery");
                return;
            }

            self.close_session().await;
            let callback = self.callback.lock().clone();
            if let Some(listener) = callback {
                listener.stop_consuming().await;
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            match self.open_session().await {
                Ok(()) => debug!(label = %self.label, "producer recovered"),
                Err(err) => error!(
                    label = %self.label,
                    error = err.to_string(),
                    "failure to recover producer"
                ),
            }
        })
    }

    fn handles(&self) -> Result<(Arc<Channel>, Arc<dyn PublishConfirmationTracker>), BusError> {
        self.current.read().clone().ok_or_else(|| {
            BusError::ChannelShutdown(format!("producer for `{}` is not started", self.label))
        })
    }

    /// Adds the sender-level and carried-over headers the message lacks.
    fn stamp(&self, mut message: Message) -> Message {
        for (key, value) in self.handling.header_storage.load() {
            message.headers.entry(key).or_insert(value);
        }
        if let Some(ttl) = self.options.ttl() {
            message
                .headers
                .entry(HEADER_TTL.to_owned())
                .or_insert(HeaderValue::Int(ttl.as_millis() as i64));
        }
        if self.options.persist {
            message
                .headers
                .entry(HEADER_PERSIST.to_owned())
                .or_insert(HeaderValue::Bool(true));
        }
        message
    }
}

#[async_trait]
impl MessageSender for Producer {
    fn connection_key(&self) -> String {
        self.endpoint.url.clone()
    }

    fn is_healthy(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|(channel, _)| channel.is_open())
            .unwrap_or(false)
    }

    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let (channel, tracker) = self.handles()?;
        let message = self.stamp(message);
        let route = self.handling.resolver.resolve(&self.endpoint, &message.label);
        let converter = self.handling.converter.as_ref();

        if self.options.confirmation_required {
            let confirmation = channel
                .publish_tracked(&route, &message, converter, tracker.as_ref(), None)
                .await?;
            confirmation.await
        } else {
            channel.publish(&route, &message, converter, None).await
        }
    }

    async fn request(&self, message: Message, expected: MessageLabel) -> Result<Message, BusError> {
        let Some(listener) = self.callback_listener() else {
            return Err(BusError::NoCallbackListener(self.label.to_string()));
        };
        let Some(reply_route) = listener.reply_route() else {
            return Err(BusError::NotConsuming(listener.url().to_owned()));
        };

        let correlation_id = message
            .correlation_id()
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = message.timeout().or(self.options.timeout());

        let mut message = message
            .with_header(HEADER_CORRELATION_ID, correlation_id.as_str())
            .with_header(HEADER_REPLY_ROUTE, reply_route.to_string());
        if let Some(timeout) = timeout {
            message = message.with_header(HEADER_TIMEOUT, timeout.as_millis() as i64);
        }

        let response = listener.expect(&correlation_id, expected, timeout)?;
        if let Err(err) = self.publish(message).await {
            listener.forget_expectation(&correlation_id);
            return Err(err);
        }

        response.await
    }
}
