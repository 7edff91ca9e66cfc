//! Fan-out of change batches to every listener.
//!
//! Uses a tokio broadcast channel: one publish reaches all receivers, each
//! receiver buffers up to `capacity` events. A receiver that falls further
//! behind skips the oldest events; the skip is logged and counted.
//!
//! Consumers that must see every event (the mirror) take an unbounded
//! subscription instead, which never skips.
//!
//! ```text
//!  RowStore ──publish──► ChangeFeed ══► mirror task ──► session feed ──► listener
//!                                  └──► ...                         └──► listener
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};

use crate::change::ChangeBatch;

/// Where a batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Written through this process's views.
    Local,
    /// Pulled from the remote.
    Remote,
}

#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub origin: Origin,
    pub batch: Arc<ChangeBatch>,
}

/// Snapshot of feed counters.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

struct AtomicFeedStats {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Broadcast channel of [`FeedEvent`]s.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<FeedEvent>,
    /// Unbounded subscribers; closed ones are pruned on publish
    sinks: Arc<Mutex<Vec<mpsc::UnboundedSender<FeedEvent>>>>,
    capacity: usize,
    stats: Arc<AtomicFeedStats>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sinks: Arc::new(Mutex::new(Vec::new())),
            capacity,
            stats: Arc::new(AtomicFeedStats {
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a batch. Empty batches are skipped.
    ///
    /// Returns the number of receivers the event reached.
    pub fn publish(&self, origin: Origin, batch: ChangeBatch) -> usize {
        if batch.is_empty() {
            return 0;
        }
        self.publish_event(FeedEvent {
            origin,
            batch: Arc::new(batch),
        })
    }

    /// Forward an already-built event.
    pub fn publish_event(&self, event: FeedEvent) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let mut reached = {
            let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
            sinks.retain(|sink| sink.send(event.clone()).is_ok());
            sinks.len()
        };
        reached += self.sender.send(event).unwrap_or(0);
        reached
    }

    pub fn subscribe(&self) -> FeedReceiver {
        FeedReceiver {
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Subscribe without a buffer limit. Every event is delivered in order.
    pub fn subscribe_unbounded(&self) -> mpsc::UnboundedReceiver<FeedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let sinks = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sink| !sink.is_closed())
            .count();
        self.sender.receiver_count() + sinks
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            published: self.stats.published.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Receiving end of a [`ChangeFeed`].
pub struct FeedReceiver {
    rx: broadcast::Receiver<FeedEvent>,
    stats: Arc<AtomicFeedStats>,
}

impl FeedReceiver {
    /// Next event, or `None` once every sender is gone.
    ///
    /// Lagging is absorbed: skipped events are counted and logged.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.stats.dropped.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!("Change feed receiver lagged, {skipped} batches skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
