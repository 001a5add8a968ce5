// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Confirmation Tracking
//!
//! When a sender requires broker confirmation, every publish is registered
//! under the channel's sequence number before it is sent. The broker later acks
//! or nacks sequence numbers (optionally cumulatively) and the tracker resolves
//! the matching futures. Whatever is still pending when the channel shuts down
//! or the producer restarts is failed, so no publisher waits forever.

use crate::errors::BusError;
use futures_util::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Resolves once the broker confirmed (or refused) a publish.
pub type ConfirmationFuture = BoxFuture<'static, Result<(), BusError>>;

/// Correlates broker sequence numbers with pending publishes.
pub trait PublishConfirmationTracker: Send + Sync {
    /// Registers a pending confirmation for `seq_no`.
    fn track(&self, seq_no: u64) -> ConfirmationFuture;

    /// Applies a broker ack (`confirmed`) or nack. With `multiple` every
    /// pending sequence number up to and including `seq_no` is resolved.
    fn handle_confirmation(&self, confirmed: bool, seq_no: u64, multiple: bool);

    /// Fails and removes a single pending entry, used when the publish itself failed.
    fn forget(&self, seq_no: u64, error: BusError);

    /// Fails every pending entry as unconfirmed; the channel went away.
    fn fail_unconfirmed(&self, reason: &str);

    /// Fails every pending entry as rejected and clears the tracker.
    fn reset(&self);

    fn dispose(&self) {
        self.reset()
    }

    /// Number of publishes awaiting confirmation.
    fn pending(&self) -> usize;
}

type Pending = oneshot::Sender<Result<(), BusError>>;

/// Tracker used when the sender requires confirmation.
#[derive(Default)]
pub struct DefaultPublishConfirmationTracker {
    pending: Mutex<BTreeMap<u64, Pending>>,
}

impl DefaultPublishConfirmationTracker {
    pub fn new() -> DefaultPublishConfirmationTracker {
        DefaultPublishConfirmationTracker::default()
    }

    fn drain(&self) -> BTreeMap<u64, Pending> {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl PublishConfirmationTracker for DefaultPublishConfirmationTracker {
    fn track(&self, seq_no: u64) -> ConfirmationFuture {
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&seq_no) {
                warn!(seq_no, "sequence number is already tracked");
                return futures_util::future::ready(Err(BusError::InternalError(format!(
                    "sequence number `{}` is already tracked",
                    seq_no
                ))))
                .boxed();
            }
            pending.insert(seq_no, tx);
        }

        async move { rx.await.unwrap_or(Err(BusError::Cancelled)) }.boxed()
    }

    fn handle_confirmation(&self, confirmed: bool, seq_no: u64, multiple: bool) {
        let resolved: Vec<(u64, Pending)> = {
            let mut pending = self.pending.lock();
            if multiple {
                let rest = pending.split_off(&seq_no.saturating_add(1));
                std::mem::replace(&mut *pending, rest).into_iter().collect()
            } else {
                pending
                    .remove(&seq_no)
                    .map(|tx| vec![(seq_no, tx)])
                    .unwrap_or_default()
            }
        };

        if resolved.is_empty() {
            debug!(seq_no, multiple, "confirmation for untracked sequence number");
        }

        for (seq, tx) in resolved {
            let result = if confirmed {
                Ok(())
            } else {
                Err(BusError::Rejected(seq))
            };
            let _ = tx.send(result);
        }
    }

    fn forget(&self, seq_no: u64, error: BusError) {
        if let Some(tx) = self.pending.lock().remove(&seq_no) {
            let _ = tx.send(Err(error));
        }
    }

    fn fail_unconfirmed(&self, reason: &str) {
        let pending = self.drain();
        if !pending.is_empty() {
            warn!(count = pending.len(), reason, "failing unconfirmed publishes");
        }
        for (seq_no, tx) in pending {
            let _ = tx.send(Err(BusError::Unconfirmed {
                seq_no,
                reason: reason.to_owned(),
            }));
        }
    }

    fn reset(&self) {
        for (seq_no, tx) in self.drain() {
            let _ = tx.send(Err(BusError::Rejected(seq_no)));
        }
    }

    fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Tracker used when the sender does not require confirmation.
#[derive(Debug, Default, Clone)]
pub struct NoopPublishConfirmationTracker;

impl PublishConfirmationTracker for NoopPublishConfirmationTracker {
    fn track(&self, _seq_no: u64) -> ConfirmationFuture {
        futures_util::future::ready(Ok(())).boxed()
    }

    fn handle_confirmation(&self, _confirmed: bool, _seq_no: u64, _multiple: bool) {}

    fn forget(&self, _seq_no: u64, _error: BusError) {}

    fn fail_unconfirmed(&self, _reason: &str) {}

    fn reset(&self) {}

    fn pending(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;

    #[tokio::test]
    async fn nack_fails_only_its_own_sequence_number() {
        let tracker = DefaultPublishConfirmationTracker::new();
        let four = tracker.track(4);
        let five = tracker.track(5);
        let six = tracker.track(6);

        tracker.handle_confirmation(false, 5, false);

        assert_eq!(five.await, Err(BusError::Rejected(5)));
        assert_eq!(tracker.pending(), 2);

        tracker.handle_confirmation(true, 4, false);
        tracker.handle_confirmation(true, 6, false);
        assert_eq!(four.await, Ok(()));
        assert_eq!(six.await, Ok(()));
    }

    #[tokio::test]
    async fn multiple_resolves_everything_up_to_sequence_number() {
        let tracker = DefaultPublishConfirmationTracker::new();
        let futures: Vec<_> = (1..=5).map(|seq| tracker.track(seq)).collect();

        tracker.handle_confirmation(true, 3, true);
        assert_eq!(tracker.pending(), 2);

        tracker.handle_confirmation(false, 5, true);
        assert_eq!(tracker.pending(), 0);

        let results = join_all(futures).await;
        assert_eq!(
            results,
            vec![
                Ok(()),
                Ok(()),
                Ok(()),
                Err(BusError::Rejected(4)),
                Err(BusError::Rejected(5)),
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_fails_every_pending_publish_as_unconfirmed() {
        let tracker = DefaultPublishConfirmationTracker::new();
        let first = tracker.track(1);
        let second = tracker.track(2);

        tracker.fail_unconfirmed("channel closed");

        assert_eq!(tracker.pending(), 0);
        assert_eq!(
            first.await,
            Err(BusError::Unconfirmed {
                seq_no: 1,
                reason: "channel closed".to_owned()
            })
        );
        assert!(matches!(second.await, Err(BusError::Unconfirmed { seq_no: 2, .. })));
    }

    #[tokio::test]
    async fn reset_rejects_pending_publishes() {
        let tracker = DefaultPublishConfirmationTracker::new();
        let pending = tracker.track(9);

        tracker.reset();

        assert_eq!(pending.await, Err(BusError::Rejected(9)));
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn sequence_numbers_are_never_tracked_twice() {
        let tracker = DefaultPublishConfirmationTracker::new();
        let original = tracker.track(1);
        let duplicate = tracker.track(1);

        assert!(matches!(duplicate.await, Err(BusError::InternalError(_))));
        assert_eq!(tracker.pending(), 1);

        tracker.handle_confirmation(true, 1, false);
        assert_eq!(original.await, Ok(()));
    }

    #[tokio::test]
    async fn noop_tracker_is_always_confirmed() {
        let tracker = NoopPublishConfirmationTracker;
        assert_eq!(tracker.track(0).await, Ok(()));
        assert_eq!(tracker.pending(), 0);
    }
}
