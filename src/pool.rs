// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Pool
//!
//! The pool is the only owner of broker connections. Reusable connections are
//! kept per key (the broker URL); concurrent requests for one key wait on a
//! per-key gate so only one connection attempt is in flight, while other keys
//! proceed. Dedicated connections are created on every request and tracked
//! until they dispose themselves.

use crate::{
    connection::{Connection, ConnectionSettings},
    errors::BusError,
    transport::Transport,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Connections = Arc<Mutex<HashMap<String, Arc<Connection>>>>;

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pooled: Connections,
    dedicated: Connections,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, settings: ConnectionSettings) -> ConnectionPool {
        ConnectionPool {
            transport,
            settings,
            gates: Mutex::new(HashMap::default()),
            pooled: Arc::default(),
            dedicated: Arc::default(),
        }
    }

    /// Returns an open connection for `key`, waiting for it to open if needed.
    /// With `reuse` every call for the same key shares one live connection;
    /// without it every call gets a connection of its own.
    pub async fn get(
        &self,
        key: &str,
        reuse: bool,
        token: &CancellationToken,
    ) -> Result<Arc<Connection>, BusError> {
        if !reuse {
            let connection = self.create(key, &self.dedicated, connection_id_key);
            connection.open(token).await?;
            self.dedicated
                .lock()
                .insert(connection.id().to_owned(), connection.clone());
            return Ok(connection);
        }

        let gate = self.gates.lock().entry(key.to_owned()).or_default().clone();
        let _guard = tokio::select! {
            _ = token.cancelled() => return Err(BusError::Cancelled),
            guard = gate.lock() => guard,
        };

        let existing = self
            .pooled
            .lock()
            .get(key)
            .filter(|connection| connection.is_open())
            .cloned();
        if let Some(connection) = existing {
            return Ok(connection);
        }

        let connection = self.create(key, &self.pooled, |key, _| key.to_owned());
        connection.open(token).await?;
        self.pooled.lock().insert(key.to_owned(), connection.clone());
        debug!(key, id = connection.id(), "pooled connection opened");

        Ok(connection)
    }

    fn create(
        &self,
        key: &str,
        registry: &Connections,
        slot: fn(&str, &Connection) -> String,
    ) -> Arc<Connection> {
        let connection = Connection::new(key, self.transport.clone(), self.settings.clone());
        let slot = slot(key, &connection);

        let registry = Arc::downgrade(registry);
        connection.on_disposed(move |id| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut connections = registry.lock();
            if connections.get(&slot).map(|c| c.id() == id).unwrap_or(false) {
                connections.remove(&slot);
                debug!(id, "connection evicted from pool");
            }
        });

        connection
    }

    /// Closes every pooled connection and empties the pool.
    pub async fn drop_all(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut pooled = self.pooled.lock();
            let mut dedicated = self.dedicated.lock();
            pooled
                .drain()
                .map(|(_, c)| c)
                .chain(dedicated.drain().map(|(_, c)| c))
                .collect()
        };
        self.gates.lock().clear();

        debug!(count = connections.len(), "dropping pooled connections");
        join_all(connections.iter().map(|connection| connection.close())).await;
    }

    /// Number of tracked connections.
    pub fn count(&self) -> usize {
        self.pooled.lock().len() + self.dedicated.lock().len()
    }
}

fn connection_id_key(_key: &str, connection: &Connection) -> String {
    connection.id().to_owned()
}
