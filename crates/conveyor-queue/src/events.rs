//! Per-build event stream: a bounded in-memory ring over the persistent
//! event feed, with wakeups for live subscribers.
//!
//! Ordering is monotonic within a build; events for different builds have
//! no cross-order guarantee. Subscribers pass the first sequence number
//! they want and receive every event from there, backfilled from the
//! store when the ring has already rotated past it.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use conveyor_core::event::{EventSink, NewQueueEvent, QueueEvent};
use conveyor_core::{ResourceId, Result};
use conveyor_db::EventRepo;

/// Events kept in memory per build before older ones are only reachable
/// through the store.
const RING_CAPACITY: usize = 256;

struct Topic {
    ring: VecDeque<QueueEvent>,
    notify: Arc<Notify>,
}

impl Topic {
    fn new() -> Self {
        Self {
            ring: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

type Topics = Arc<Mutex<HashMap<ResourceId, Topic>>>;

pub struct EventBroker {
    store: Arc<dyn EventRepo>,
    topics: Topics,
}

impl EventBroker {
    pub fn new(store: Arc<dyn EventRepo>) -> Self {
        Self {
            store,
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persist the event, append it to the build's ring, and wake
    /// subscribers.
    pub async fn publish(&self, draft: NewQueueEvent) -> Result<QueueEvent> {
        let event = self.store.append_event(draft).await?;
        let notify = {
            let mut topics = self.topics.lock().expect("event broker lock poisoned");
            let topic = topics.entry(event.build_id).or_insert_with(Topic::new);
            topic.ring.push_back(event.clone());
            while topic.ring.len() > RING_CAPACITY {
                topic.ring.pop_front();
            }
            topic.notify.clone()
        };
        notify.notify_waiters();
        Ok(event)
    }

    /// Subscribe starting at `from_seq` (inclusive).
    pub fn subscribe(&self, build_id: ResourceId, from_seq: u64) -> EventSubscription {
        let notify = {
            let mut topics = self.topics.lock().expect("event broker lock poisoned");
            topics
                .entry(build_id)
                .or_insert_with(Topic::new)
                .notify
                .clone()
        };
        EventSubscription {
            store: self.store.clone(),
            topics: self.topics.clone(),
            notify,
            build_id,
            next_seq: from_seq.max(1),
        }
    }
}

#[async_trait]
impl EventSink for EventBroker {
    async fn publish(&self, event: NewQueueEvent) -> Result<QueueEvent> {
        EventBroker::publish(self, event).await
    }
}

pub struct EventSubscription {
    store: Arc<dyn EventRepo>,
    topics: Topics,
    notify: Arc<Notify>,
    build_id: ResourceId,
    next_seq: u64,
}

impl EventSubscription {
    fn from_ring(&self, seq: u64) -> Option<QueueEvent> {
        let topics = self.topics.lock().expect("event broker lock poisoned");
        let topic = topics.get(&self.build_id)?;
        // The ring is contiguous; anything older than its front lives only
        // in the store.
        topic.ring.iter().find(|e| e.seq == seq).cloned()
    }

    /// The next event in order, waiting for it if it has not happened yet.
    pub async fn next(&mut self) -> Result<QueueEvent> {
        loop {
            // Register interest before checking, so a publish racing with
            // the lookup is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.from_ring(self.next_seq) {
                self.next_seq += 1;
                return Ok(event);
            }
            let backfill = self
                .store
                .events_after(self.build_id, self.next_seq - 1, 1)
                .await?;
            if let Some(event) = backfill.into_iter().next() {
                self.next_seq = event.seq + 1;
                return Ok(event);
            }

            notified.await;
        }
    }

    /// Any already-available events, without waiting.
    pub async fn drain_ready(&mut self) -> Result<Vec<QueueEvent>> {
        let events = self
            .store
            .events_after(self.build_id, self.next_seq - 1, 10_000)
            .await?;
        if let Some(last) = events.last() {
            self.next_seq = last.seq + 1;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::event::QueueEventKind;
    use conveyor_db::MemoryStore;
    use std::time::Duration;

    fn broker() -> Arc<EventBroker> {
        Arc::new(EventBroker::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn subscriber_receives_in_order() {
        let broker = broker();
        let build = ResourceId::new();
        let mut sub = broker.subscribe(build, 1);
        for _ in 0..3 {
            broker
                .publish(NewQueueEvent::new(build, QueueEventKind::JobAdded, ResourceId::new()))
                .await
                .unwrap();
        }
        assert_eq!(sub.next().await.unwrap().seq, 1);
        assert_eq!(sub.next().await.unwrap().seq, 2);
        assert_eq!(sub.next().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn subscriber_wakes_on_new_events() {
        let broker = broker();
        let build = ResourceId::new();
        let mut sub = broker.subscribe(build, 1);

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                broker
                    .publish(NewQueueEvent::new(
                        build,
                        QueueEventKind::LogSealed,
                        ResourceId::new(),
                    ))
                    .await
                    .unwrap();
            })
        };
        let event = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("subscriber should wake")
            .unwrap();
        assert_eq!(event.kind, QueueEventKind::LogSealed);
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_backfills_from_store() {
        let broker = broker();
        let build = ResourceId::new();
        // Publish past the ring capacity so early events leave the ring.
        for _ in 0..(RING_CAPACITY + 10) {
            broker
                .publish(NewQueueEvent::new(build, QueueEventKind::JobAdded, ResourceId::new()))
                .await
                .unwrap();
        }
        let mut sub = broker.subscribe(build, 1);
        assert_eq!(sub.next().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn drain_ready_returns_everything_available() {
        let broker = broker();
        let build = ResourceId::new();
        for _ in 0..5 {
            broker
                .publish(NewQueueEvent::new(build, QueueEventKind::JobAdded, ResourceId::new()))
                .await
                .unwrap();
        }
        let mut sub = broker.subscribe(build, 2);
        let ready = sub.drain_ready().await.unwrap();
        assert_eq!(ready.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        assert!(sub.drain_ready().await.unwrap().is_empty());
    }
}
