use crate::bus::{DomainEvent, FeedEvent};
use chrono::Utc;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Fan-out of committed domain events to presentation subscribers.
///
/// Sequence numbers are assigned and sent under one lock, so every
/// subscriber observes events in commit order with strictly increasing
/// `seq`. Slow subscribers lag (and see `RecvError::Lagged`) rather than
/// block publishers.
pub struct EventFeed {
    tx: broadcast::Sender<FeedEvent>,
    next_seq: Mutex<u64>,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_seq: Mutex::new(1),
        }
    }

    /// Publish an event; returns its sequence number.
    pub fn publish(&self, event: DomainEvent) -> u64 {
        let mut next = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = *next;
        *next += 1;
        let name = event.name();
        let receivers = self
            .tx
            .send(FeedEvent {
                seq,
                at: Utc::now(),
                event,
            })
            .unwrap_or(0);
        debug!(
            "domain event published: seq={} type={} subscribers={}",
            seq, name, receivers
        );
        seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}
