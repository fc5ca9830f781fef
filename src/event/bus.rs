//! In-process publish/subscribe with per-subscriber bounded queues.
//!
//! `publish` never blocks: a subscriber that cannot keep up has events
//! dropped and counted rather than stalling the publisher. Per-subscriber
//! ordering is FIFO; ordering across subscribers is unspecified.

use super::{Event, EventFilter};
use crate::errors::{QuorumError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
struct SubscriberEntry {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

#[derive(Debug)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<u64, SubscriberEntry>,
    closed: bool,
}

/// Project-scoped event bus. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    default_capacity: usize,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
                closed: false,
            })),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Register a subscriber with the bus-default queue capacity.
    pub fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        self.subscribe_with_capacity(filter, self.default_capacity)
    }

    pub fn subscribe_with_capacity(
        &self,
        filter: EventFilter,
        capacity: usize,
    ) -> Result<Subscription> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QuorumError::InvalidArgument(
                "event bus is closed".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            SubscriberEntry {
                filter,
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        Ok(Subscription {
            id,
            rx,
            dropped,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Fan an event out to every matching subscriber. Never blocks and never
    /// fails; queue overflow increments the subscriber's dropped counter.
    pub fn publish(&self, event: Event) {
        let mut stale = Vec::new();
        {
            let inner = self.lock();
            if inner.closed {
                return;
            }
            for (id, entry) in &inner.subscribers {
                if !entry.filter.matches(&event) {
                    continue;
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        entry.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => stale.push(*id),
                }
            }
        }
        if !stale.is_empty() {
            let mut inner = self.lock();
            for id in stale {
                inner.subscribers.remove(&id);
            }
        }
    }

    /// Close the bus: all subscriber channels are closed once their queued
    /// events have been drained, and further publishes become no-ops.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        debug!(subscribers = count, "event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        // Bus state is plain data; a poisoned lock only means a panicking
        // publisher, so the state itself is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiving half of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    /// Receive the next event; `None` once the bus has closed and the queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Number of events dropped because this subscriber's queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.subscribers.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, EventPayload};

    fn event(project: &str, payload: EventPayload) -> Event {
        Event::new(project, "wf-test", payload)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = EventBus::new(8);
        let mut all = bus.subscribe(EventFilter::all()).unwrap();
        let mut scoped = bus.subscribe(EventFilter::for_project("p1")).unwrap();

        bus.publish(event("p1", EventPayload::WorkflowCancelled));
        bus.publish(event("p2", EventPayload::WorkflowCancelled));

        assert_eq!(all.recv().await.unwrap().project_id, "p1");
        assert_eq!(all.recv().await.unwrap().project_id, "p2");
        assert_eq!(scoped.recv().await.unwrap().project_id, "p1");
        assert!(scoped.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new(8);
        let mut sub = bus
            .subscribe(EventFilter::all().with_kinds([EventKind::TokenUpdate]))
            .unwrap();
        bus.publish(event("p", EventPayload::WorkflowCancelled));
        bus.publish(event(
            "p",
            EventPayload::TokenUpdate {
                tokens_in: 10,
                tokens_out: 20,
                cost_usd: 0.01,
            },
        ));
        let got = sub.recv().await.unwrap();
        assert_eq!(got.kind(), EventKind::TokenUpdate);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(EventFilter::all()).unwrap();
        for _ in 0..5 {
            bus.publish(event("p", EventPayload::WorkflowCancelled));
        }
        assert_eq!(sub.dropped_count(), 3);
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_drains_then_ends_subscriptions() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(EventFilter::all()).unwrap();
        bus.publish(event("p", EventPayload::WorkflowCancelled));
        bus.close();

        // Queued event still arrives, then the channel ends.
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());

        // Publish after close is a no-op; subscribe after close fails.
        bus.publish(event("p", EventPayload::WorkflowCancelled));
        assert!(bus.subscribe(EventFilter::all()).is_err());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe(EventFilter::all()).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(EventFilter::all()).unwrap();
        for round in 1..=5 {
            bus.publish(event(
                "p",
                EventPayload::ConsensusScore {
                    round,
                    score: 0.5,
                    moderator: "m".into(),
                },
            ));
        }
        for expected in 1..=5 {
            match sub.recv().await.unwrap().payload {
                EventPayload::ConsensusScore { round, .. } => assert_eq!(round, expected),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }
}
