// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! Wraps one native broker connection. Opening retries with a linear back-off
//! until it succeeds or is cancelled. When the broker drops the connection the
//! `closed` and `channel_failed` events fire, then the connection disposes
//! itself so the pool evicts it. A client-initiated close only disposes.

use crate::{
    channel::Channel,
    config::RetryPolicy,
    errors::BusError,
    transport::{NativeConnection, Transport},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

type OpenedHandler = Arc<dyn Fn() + Send + Sync>;
type ClosedHandler = Arc<dyn Fn(&str) + Send + Sync>;
type ChannelFailedHandler = Arc<dyn Fn(&BusError) + Send + Sync>;
type DisposedHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Open,
    Closing,
    Closed,
}

#[derive(Default)]
struct Handlers {
    opened: Vec<OpenedHandler>,
    closed: Vec<ClosedHandler>,
    channel_failed: Vec<ChannelFailedHandler>,
    disposed: Vec<DisposedHandler>,
}

/// Settings shared by every connection of a pool.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub name: String,
    pub retry: RetryPolicy,
    pub close_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            name: "rabbit-bus".to_owned(),
            retry: RetryPolicy::default(),
            close_timeout: Duration::from_secs(3),
        }
    }
}

pub struct Connection {
    id: String,
    url: String,
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    native: Mutex<Option<Arc<dyn NativeConnection>>>,
    state: Mutex<State>,
    disposed: AtomicBool,
    handlers: Mutex<Handlers>,
}

impl Connection {
    pub fn new(
        url: &str,
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            id: Uuid::new_v4().to_string(),
            url: url.to_owned(),
            transport,
            settings,
            native: Mutex::new(None),
            state: Mutex::new(State::Created),
            disposed: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == State::Open
            && self
                .native
                .lock()
                .as_ref()
                .map(|native| native.is_open())
                .unwrap_or(false)
    }

    pub fn on_opened<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        self.handlers.lock().opened.push(Arc::new(handler));
    }

    /// Fired with the reason when the broker ends the connection.
    pub fn on_closed<F: Fn(&str) + Send + Sync + 'static>(&self, handler: F) {
        self.handlers.lock().closed.push(Arc::new(handler));
    }

    pub fn on_channel_failed<F: Fn(&BusError) + Send + Sync + 'static>(&self, handler: F) {
        self.handlers.lock().channel_failed.push(Arc::new(handler));
    }

    /// Fired once with the connection id when the connection is done for good.
    pub fn on_disposed<F: Fn(&str) + Send + Sync + 'static>(&self, handler: F) {
        self.handlers.lock().disposed.push(Arc::new(handler));
    }

    /// Connects, retrying until success or cancellation.
    pub async fn open(self: &Arc<Self>, token: &CancellationToken) -> Result<(), BusError> {
        let mut attempt = 0_u32;

        loop {
            if token.is_cancelled() {
                return Err(BusError::Cancelled);
            }

            let connected = tokio::select! {
                _ = token.cancelled() => return Err(BusError::Cancelled),
                connected = self.transport.connect(&self.url, &self.settings.name) => connected,
            };

            match connected {
                Ok(native) => return self.opened(native),
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.settings.retry.delay(attempt);
                    warn!(
                        url = %self.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = err.to_string(),
                        "failure to connect, retrying"
                    );

                    tokio::select! {
                        _ = token.cancelled() => return Err(BusError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn opened(self: &Arc<Self>, native: Arc<dyn NativeConnection>) -> Result<(), BusError> {
        {
            let mut state = self.state.lock();
            if matches!(*state, State::Closing | State::Closed) {
                native.abort();
                return Err(BusError::ConnectionShutdown(format!(
                    "connection `{}` was closed while opening",
                    self.id
                )));
            }
            *state = State::Open;
        }

        let weak = Arc::downgrade(self);
        native.on_shutdown(Box::new(move |reason| {
            if let Some(connection) = weak.upgrade() {
                connection.handle_shutdown(&reason);
            }
        }));
        *self.native.lock() = Some(native);

        debug!(url = %self.url, id = %self.id, "connection opened");
        let handlers = self.handlers.lock().opened.clone();
        for handler in handlers {
            handler();
        }

        Ok(())
    }

    /// Opens a channel on the connection.
    pub async fn open_channel(&self) -> Result<Arc<Channel>, BusError> {
        let native = if *self.state.lock() == State::Open {
            self.native.lock().clone()
        } else {
            None
        };
        let Some(native) = native.filter(|native| native.is_open()) else {
            return Err(BusError::ConnectionNotOpen(self.url.clone()));
        };

        match native.create_channel().await {
            Ok(channel) => Ok(Channel::new(channel)),
            Err(err) => {
                error!(url = %self.url, error = err.to_string(), "failure to open channel");
                let handlers = self.handlers.lock().channel_failed.clone();
                for handler in handlers {
                    handler(&err);
                }
                Err(err)
            }
        }
    }

    /// Closes the connection. Idempotent; the graceful close is aborted after
    /// the configured timeout.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, State::Closing | State::Closed) {
                return;
            }
            *state = State::Closing;
        }

        let native = self.native.lock().take();
        if let Some(native) = native {
            match tokio::time::timeout(self.settings.close_timeout, native.close()).await {
                Ok(Ok(())) => debug!(url = %self.url, id = %self.id, "connection closed"),
                Ok(Err(err)) => {
                    warn!(
                        url = %self.url,
                        error = err.to_string(),
                        "failure to close connection, aborting"
                    );
                    native.abort();
                }
                Err(_) => {
                    warn!(url = %self.url, "timeout closing connection, aborting");
                    native.abort();
                }
            }
        }

        *self.state.lock() = State::Closed;
        self.dispose();
    }

    fn handle_shutdown(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state != State::Open {
                return;
            }
            *state = State::Closed;
        }
        self.native.lock().take();

        warn!(url = %self.url, id = %self.id, reason, "connection shut down by the broker");

        let (closed, channel_failed) = {
            let handlers = self.handlers.lock();
            (handlers.closed.clone(), handlers.channel_failed.clone())
        };
        for handler in closed {
            handler(reason);
        }
        let err = BusError::ConnectionShutdown(reason.to_owned());
        for handler in channel_failed {
            handler(&err);
        }

        self.dispose();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers = std::mem::take(&mut self.handlers.lock().disposed);
        for handler in handlers {
            handler(&self.id);
        }
    }
}
