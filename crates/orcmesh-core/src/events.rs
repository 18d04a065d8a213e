//! Event Bus: ordered fan-out of typed lifecycle events to independent
//! subscribers, with bounded per-subscriber buffers that never block
//! producers.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::types::{TaskId, WorkerId};

/// Tag identifying the shape of an event's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OrchestratorStarted,
    OrchestratorPaused,
    OrchestratorResumed,
    OrchestratorStopped,
    OrchestratorFailed,
    WorkerSpawned,
    WorkerReady,
    WorkerFailed,
    WorkerRestarted,
    WorkerTerminated,
    TaskSubmitted,
    TaskReady,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimedOut,
    TaskCancelled,
    TaskCascadeFailed,
    ScaleUp,
    ScaleDown,
    CheckpointSaved,
    AlertTriggered,
    Internal,
    Custom,
}

/// A single event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub task_id: Option<TaskId>,
    pub worker_id: Option<WorkerId>,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            source: source.into(),
            task_id: None,
            worker_id: None,
            payload: Value::Null,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<WorkerId>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    fn dropped_marker() -> Self {
        Event::new(EventKind::Internal, "event_bus")
            .with_payload(serde_json::json!({"marker": "EventsDropped"}))
    }
}

const SUBSCRIBER_BUFFER: usize = 256;

struct Inner {
    buffer: VecDeque<Event>,
    dropped_pending: bool,
}

struct SubscriberState {
    kinds: Option<Vec<EventKind>>,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl SubscriberState {
    fn push(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        let overflow = inner.buffer.len() >= SUBSCRIBER_BUFFER;
        if overflow {
            inner.buffer.pop_front();
            if !inner.dropped_pending {
                inner.dropped_pending = true;
                if inner.buffer.len() >= SUBSCRIBER_BUFFER {
                    inner.buffer.pop_front();
                }
                inner.buffer.push_back(Event::dropped_marker());
            }
        } else {
            inner.dropped_pending = false;
        }
        if inner.buffer.len() >= SUBSCRIBER_BUFFER {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(event);
        drop(inner);
        self.notify.notify_waiters();
    }
}

/// A live subscription to the bus; implements [`Stream`] over delivered
/// events. Dropping this ends the subscription and prunes it from the bus
/// on the next publish.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Fans out events to any number of independent subscribers. Delivery to
/// each subscriber is ordered and at-least-once; a subscriber whose buffer
/// overflows has its oldest buffered event dropped and receives exactly
/// one `EventsDropped` marker rather than blocking the publisher.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<SubscriberState>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a filtered (or unfiltered, if `None`) stream of events.
    pub fn subscribe(&self, kinds: Option<Vec<EventKind>>) -> EventStream {
        let state = Arc::new(SubscriberState {
            kinds,
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                dropped_pending: false,
            }),
            notify: Notify::new(),
        });
        self.subscribers
            .lock()
            .unwrap()
            .push(Arc::downgrade(&state));

        Box::pin(stream! {
            loop {
                let next = state.inner.lock().unwrap().buffer.pop_front();
                match next {
                    Some(event) => yield event,
                    None => state.notify.notified().await,
                }
            }
        })
    }

    /// Number of currently live subscribers (dead ones are pruned lazily
    /// on the next `publish`).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Publish `event` to every matching, still-live subscriber.
    ///
    /// Never blocks: a full subscriber buffer causes that subscriber's
    /// oldest buffered event to be dropped and (once, until it next catches
    /// up) replaced with an `EventsDropped` marker.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            if let Some(kinds) = &state.kinds {
                if !kinds.contains(&event.kind) {
                    return true;
                }
            }
            state.push(event.clone());
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(None);

        bus.publish(Event::new(EventKind::TaskSubmitted, "test").with_task("t1"));
        bus.publish(Event::new(EventKind::TaskStarted, "test").with_task("t1"));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.kind, EventKind::TaskSubmitted);
        assert_eq!(second.kind, EventKind::TaskStarted);
    }

    #[tokio::test]
    async fn filtered_subscriber_only_sees_matching_kinds() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(Some(vec![EventKind::TaskFailed]));

        bus.publish(Event::new(EventKind::TaskSubmitted, "test"));
        bus.publish(Event::new(EventKind::TaskFailed, "test"));

        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, EventKind::TaskFailed);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_emits_single_marker() {
        let bus = EventBus::new();
        let stream = bus.subscribe(None);

        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(Event::new(EventKind::Custom, "test"));
        }

        let events: Vec<Event> = stream
            .take(SUBSCRIBER_BUFFER)
            .collect::<Vec<_>>()
            .await;
        let marker_count = events
            .iter()
            .filter(|e| e.payload.get("marker") == Some(&serde_json::json!("EventsDropped")))
            .count();
        assert_eq!(marker_count, 1);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        {
            let _stream = bus.subscribe(None);
        } // dropped immediately
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(Event::new(EventKind::Custom, "test"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
