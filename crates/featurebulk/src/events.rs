//! Pipeline events and their subscriptions.
//!
//! Components publish [`PipelineEvent`]s on a shared [`EventChannel`].
//! Subscribers hold a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the subscriber from the channel.
//! Each subscription buffers a bounded number of events. When a subscriber
//! falls behind, further events for it are dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ErrorKind;
use crate::pipeline::RunSummary;

/// Something observable that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A record was written (import) or emitted (export).
    RecordProcessed {
        external_id: String,
        internal_id: Option<i64>,
    },
    /// A record was skipped because of a recoverable error.
    RecordFailed {
        external_id: Option<String>,
        kind: ErrorKind,
        reason: String,
    },
    /// A reference target never appeared; the origin column stays NULL.
    ReferenceUnresolvable {
        origin_table: String,
        origin_column: String,
        origin_id: i64,
        target_external_id: String,
    },
    /// One resolver pass over all partitions finished.
    ResolutionPassComplete {
        pass: u32,
        resolved: u64,
        unresolvable: u64,
    },
    RunFinished { summary: RunSummary },
}

/// Events buffered per subscriber unless configured otherwise.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<PipelineEvent>,
    dropped: Arc<AtomicU64>,
}

type Subscribers = Mutex<Vec<Subscriber>>;

/// Fan-out channel for pipeline events.
///
/// Cloning is cheap; clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventChannel {
    subscribers: Arc<Subscribers>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel whose subscriptions buffer at most `capacity` events each.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().push(Subscriber {
            id,
            tx,
            dropped: Arc::clone(&dropped),
        });
        Subscription {
            id,
            rx,
            dropped,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Deliver an event to every current subscriber. Never waits; a
    /// subscriber whose buffer is full misses the event.
    pub fn publish(&self, event: PipelineEvent) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if subscriber.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!(subscriber = subscriber.id, "Event subscriber is lagging; dropping events");
                    }
                }
                // A closed receiver belongs to a subscription being dropped
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// An active subscription; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<PipelineEvent>,
    dropped: Arc<AtomicU64>,
    subscribers: Arc<Subscribers>,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<PipelineEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Events this subscription missed because its buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop receiving events. Already queued events stay readable.
    pub fn unsubscribe(&mut self) {
        self.subscribers.lock().retain(|s| s.id != self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let channel = EventChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.publish(PipelineEvent::RecordProcessed {
            external_id: "gml_1".into(),
            internal_id: Some(1),
        });

        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe_is_explicit_and_on_drop() {
        let channel = EventChannel::new();
        let mut a = channel.subscribe();
        let b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        a.unsubscribe();
        assert_eq!(channel.subscriber_count(), 1);
        channel.publish(PipelineEvent::ResolutionPassComplete {
            pass: 1,
            resolved: 0,
            unresolvable: 0,
        });
        assert!(a.try_recv().is_none());

        drop(b);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_lagging_subscriber_drops_and_counts() {
        let channel = EventChannel::with_capacity(2);
        let mut slow = channel.subscribe();

        for pass in 1..=5 {
            channel.publish(PipelineEvent::ResolutionPassComplete {
                pass,
                resolved: 0,
                unresolvable: 0,
            });
        }

        let kept: Vec<_> = slow
            .drain()
            .into_iter()
            .map(|e| match e {
                PipelineEvent::ResolutionPassComplete { pass, .. } => pass,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(slow.dropped(), 3);

        // Room again once drained
        channel.publish(PipelineEvent::ResolutionPassComplete {
            pass: 6,
            resolved: 0,
            unresolvable: 0,
        });
        assert_eq!(slow.drain().len(), 1);
    }
}
