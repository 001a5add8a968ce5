// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ticket Timer
//!
//! A coarse timeout tracker. Instead of one timer per pending request, a single
//! background task wakes up every `resolution` and fires the actions of every
//! ticket whose deadline has passed. Acquiring and cancelling a ticket are
//! single map operations.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

/// Default tick interval of the timer.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_secs(1);

/// Identifies an acquired ticket.
pub type TicketId = u64;

type TicketAction = Box<dyn FnOnce() + Send>;

struct Ticket {
    deadline: Instant,
    action: TicketAction,
}

/// Coarse-grained timer issuing cancellable tickets.
pub struct TicketTimer {
    tickets: Arc<Mutex<HashMap<TicketId, Ticket>>>,
    next_id: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TicketTimer {
    /// Starts a timer ticking every `resolution`. Must be called within a tokio runtime.
    pub fn start(resolution: Duration) -> TicketTimer {
        let tickets: Arc<Mutex<HashMap<TicketId, Ticket>>> = Arc::default();
        let watched = tickets.clone();

        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            loop {
                interval.tick().await;
                fire_expired(&watched, Instant::now());
            }
        });

        TicketTimer {
            tickets,
            next_id: AtomicU64::new(1),
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// Schedules `action` to run once `timeout` has elapsed, give or take one resolution.
    pub fn acquire<F>(&self, timeout: Duration, action: F) -> TicketId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tickets.lock().insert(
            id,
            Ticket {
                deadline: Instant::now() + timeout,
                action: Box::new(action),
            },
        );
        id
    }

    /// Cancels a ticket. Returns false when it already fired or was cancelled.
    pub fn cancel(&self, id: TicketId) -> bool {
        self.tickets.lock().remove(&id).is_some()
    }

    /// Number of tickets waiting to fire.
    pub fn active(&self) -> usize {
        self.tickets.lock().len()
    }

    /// Stops ticking and drops every outstanding ticket without firing it.
    pub fn dispose(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        let dropped = {
            let mut tickets = self.tickets.lock();
            std::mem::take(&mut *tickets)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "ticket timer disposed with pending tickets");
        }
    }
}

impl Drop for TicketTimer {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
    }
}

fn fire_expired(tickets: &Mutex<HashMap<TicketId, Ticket>>, now: Instant) {
    let expired: Vec<Ticket> = {
        let mut tickets = tickets.lock();
        let ids: Vec<TicketId> = tickets
            .iter()
            .filter(|(_, ticket)| ticket.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        ids.iter().filter_map(|id| tickets.remove(id)).collect()
    };

    // Actions run outside the lock so they may acquire or cancel tickets themselves.
    for ticket in expired {
        (ticket.action)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_after_deadline_within_one_resolution() {
        let timer = TicketTimer::start(Duration::from_secs(1));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        timer.acquire(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.active(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_tickets_never_fire() {
        let timer = TicketTimer::start(Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let id = timer.acquire(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_drops_pending_tickets() {
        let timer = TicketTimer::start(Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        timer.acquire(Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.dispose();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.active(), 0);
    }
}
