// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Expectations
//!
//! An expectation is one pending request waiting for its correlated response.
//! Its completion future is shared: every caller expecting the same
//! correlation id awaits the same outcome.

use crate::{
    delivery::Delivery, errors::BusError, label::MessageLabel, message::Message,
    ticket_timer::TicketId,
};
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::{sync::oneshot, time::Instant};

/// Resolves with the response of a request.
pub type ResponseFuture = Shared<BoxFuture<'static, Result<Message, BusError>>>;

/// Turns the response delivery into the message handed to the requester.
pub type ResponseBuilder = Box<dyn Fn(&Delivery) -> Result<Message, BusError> + Send + Sync>;

type Completion = oneshot::Sender<Result<Message, BusError>>;

pub struct Expectation {
    completion: Mutex<Option<Completion>>,
    future: ResponseFuture,
    builder: ResponseBuilder,
    ticket: Mutex<Option<TicketId>>,
    created_at: Instant,
}

impl Expectation {
    pub fn new(builder: ResponseBuilder) -> Expectation {
        let (tx, rx) = oneshot::channel();
        let future = async move { rx.await.unwrap_or(Err(BusError::Cancelled)) }
            .boxed()
            .shared();

        Expectation {
            completion: Mutex::new(Some(tx)),
            future,
            builder,
            ticket: Mutex::new(None),
            created_at: Instant::now(),
        }
    }

    /// An expectation decoding the response as `expected`. The delivery's own
    /// label is kept when `expected` is empty or the wildcard.
    pub fn for_label(expected: MessageLabel) -> Expectation {
        Expectation::new(Box::new(move |delivery: &Delivery| {
            let label = if expected.is_empty() || expected.is_any() {
                delivery.label()
            } else {
                expected.clone()
            };
            delivery.to_message(label)
        }))
    }

    pub fn future(&self) -> ResponseFuture {
        self.future.clone()
    }

    pub(crate) fn set_ticket(&self, ticket: TicketId) {
        *self.ticket.lock() = Some(ticket);
    }

    pub fn ticket(&self) -> Option<TicketId> {
        *self.ticket.lock()
    }

    /// Completes the expectation with the response built from `delivery`.
    /// Returns false if it was already completed.
    pub fn complete(&self, delivery: &Delivery) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            return false;
        };
        let _ = tx.send((self.builder)(delivery));
        true
    }

    /// Fails the expectation. Returns false if it was already completed.
    pub fn fail(&self, error: BusError) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            return false;
        };
        let _ = tx.send(Err(error));
        true
    }

    pub fn is_completed(&self) -> bool {
        self.completion.lock().is_none()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_waiter_sees_the_same_failure() {
        let expectation = Expectation::for_label(MessageLabel::new("boo.result"));
        let first = expectation.future();
        let second = expectation.future();

        assert!(expectation.fail(BusError::Timeout("c-1".to_owned())));
        assert!(!expectation.fail(BusError::Cancelled));
        assert!(expectation.is_completed());

        assert_eq!(first.await, Err(BusError::Timeout("c-1".to_owned())));
        assert_eq!(second.await, Err(BusError::Timeout("c-1".to_owned())));
    }

    #[tokio::test]
    async fn dropped_expectation_resolves_as_cancelled() {
        let expectation = Expectation::for_label(MessageLabel::empty());
        let future = expectation.future();
        drop(expectation);

        assert_eq!(future.await, Err(BusError::Cancelled));
    }
}
