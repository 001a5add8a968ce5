// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routes
//!
//! A route is the physical `(exchange, routing key)` pair a message is
//! published to. Senders turn labels into routes through a `RouteResolver`.

use crate::{errors::BusError, label::MessageLabel};
use std::{fmt, str::FromStr};

#[cfg(test)]
use mockall::automock;

/// A resolved publish destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: &str, routing_key: &str) -> Route {
        Route {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }

    /// Route to a queue through the broker's default exchange.
    pub fn to_queue(queue: &str) -> Route {
        Route::new("", queue)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.routing_key)
    }
}

impl FromStr for Route {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((exchange, key)) => Ok(Route::new(exchange, key)),
            None => Err(BusError::ConfigurationError(format!(
                "`{}` is not a route, expected `exchange:routing_key`",
                s
            ))),
        }
    }
}

/// The bus endpoint a sender publishes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
}

/// Maps a label to the route it is published on.
#[cfg_attr(test, automock)]
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, endpoint: &Endpoint, label: &MessageLabel) -> Route;
}

/// Publishes every label to the exchange of the same name with an empty routing key.
#[derive(Debug, Default, Clone)]
pub struct LabelRouteResolver;

impl RouteResolver for LabelRouteResolver {
    fn resolve(&self, _endpoint: &Endpoint, label: &MessageLabel) -> Route {
        Route::new(label.name(), "")
    }
}

/// Publishes every label to one fixed route.
#[derive(Debug, Clone)]
pub struct StaticRouteResolver(pub Route);

impl RouteResolver for StaticRouteResolver {
    fn resolve(&self, _endpoint: &Endpoint, _label: &MessageLabel) -> Route {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_textual_routes() {
        let route: Route = "orders:created".parse().unwrap();
        assert_eq!(route, Route::new("orders", "created"));
        assert_eq!(route.to_string(), "orders:created");

        let to_queue: Route = ":amq.gen-1".parse().unwrap();
        assert_eq!(to_queue, Route::to_queue("amq.gen-1"));

        assert!("garbage".parse::<Route>().is_err());
    }

    #[test]
    fn label_resolver_uses_label_as_exchange() {
        let route = LabelRouteResolver.resolve(&Endpoint::default(), &MessageLabel::new("boo"));
        assert_eq!(route, Route::new("boo", ""));
    }
}
