//! In-process fan-out of job lifecycle events and log lines.
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: when
//! a queue is full the event is dropped for that subscriber and a
//! `lagged` event carrying the missed count is delivered once the
//! queue drains.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamEventType {
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "log.line")]
    LogLine,
    #[serde(rename = "lagged")]
    Lagged,
}

/// One event on the wire: a single JSON object per SSE `data:` line.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StreamEvent {
    fn new(event_type: StreamEventType, job_id: Option<Uuid>, execution_id: Option<Uuid>) -> Self {
        Self {
            event_type,
            job_id,
            execution_id,
            ts: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn job_started(job_id: Uuid, execution_id: Uuid) -> Self {
        Self::new(StreamEventType::JobStarted, Some(job_id), Some(execution_id))
    }

    pub fn job_completed(
        job_id: Uuid,
        execution_id: Uuid,
        items_crawled: i64,
        items_indexed: i64,
    ) -> Self {
        let mut event = Self::new(
            StreamEventType::JobCompleted,
            Some(job_id),
            Some(execution_id),
        );
        event
            .fields
            .insert("items_crawled".to_string(), items_crawled.into());
        event
            .fields
            .insert("items_indexed".to_string(), items_indexed.into());
        event
    }

    pub fn job_failed(job_id: Uuid, execution_id: Uuid, error: &str) -> Self {
        let mut event = Self::new(StreamEventType::JobFailed, Some(job_id), Some(execution_id));
        event.fields.insert("error".to_string(), error.into());
        event
    }

    pub fn job_cancelled(job_id: Uuid, execution_id: Uuid) -> Self {
        Self::new(
            StreamEventType::JobCancelled,
            Some(job_id),
            Some(execution_id),
        )
    }

    pub fn log_line(
        job_id: Uuid,
        execution_id: Uuid,
        level: &str,
        message: &str,
        fields: &HashMap<String, String>,
    ) -> Self {
        let mut event = Self::new(StreamEventType::LogLine, Some(job_id), Some(execution_id));
        event.fields.insert("level".to_string(), level.into());
        event.fields.insert("message".to_string(), message.into());
        if !fields.is_empty() {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), v.clone().into());
            }
            event.fields.insert("fields".to_string(), Value::Object(map));
        }
        event
    }

    fn lagged(missed: u64) -> Self {
        let mut event = Self::new(StreamEventType::Lagged, None, None);
        event.fields.insert("missed".to_string(), missed.into());
        event
    }
}

/// Subscriber-side filter. `None` means match everything.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub event_types: Option<HashSet<StreamEventType>>,
    pub job_id: Option<Uuid>,
}

impl SubscriptionFilter {
    fn matches(&self, event: &StreamEvent) -> bool {
        // Lag notifications bypass filtering; the subscriber asked for
        // a stream and needs to know it has holes.
        if event.event_type == StreamEventType::Lagged {
            return true;
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(job_id) = self.job_id {
            if event.job_id != Some(job_id) {
                return false;
            }
        }
        true
    }
}

struct SubscriberEntry {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<StreamEvent>,
    missed: AtomicU64,
}

type SubscriberMap = Arc<RwLock<HashMap<Uuid, SubscriberEntry>>>;

/// Single-process publish/subscribe fan-out for lifecycle events.
#[derive(Clone)]
pub struct SseBroker {
    subscribers: SubscriberMap,
    queue_capacity: usize,
}

impl SseBroker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity: queue_capacity.max(2),
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            SubscriberEntry {
                filter,
                tx,
                missed: AtomicU64::new(0),
            },
        );
        debug!(subscriber_id = %id, "sse subscriber registered");
        Subscription {
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    /// Deliver an event to every matching subscriber without blocking.
    /// Disconnected subscribers are swept out as a side effect.
    pub fn publish(&self, event: StreamEvent) {
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for (id, entry) in subscribers.iter() {
                if entry.tx.is_closed() {
                    closed.push(*id);
                    continue;
                }
                if !entry.filter.matches(&event) {
                    continue;
                }

                let missed = entry.missed.load(Ordering::Acquire);
                if missed > 0 {
                    if entry.tx.try_send(StreamEvent::lagged(missed)).is_ok() {
                        entry.missed.store(0, Ordering::Release);
                    } else {
                        entry.missed.fetch_add(1, Ordering::AcqRel);
                        continue;
                    }
                }

                if entry.tx.try_send(event.clone()).is_err() {
                    entry.missed.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Close every subscriber queue. Safe to call more than once.
    pub fn stop(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for SseBroker {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// One subscriber's end of the stream.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<StreamEvent>,
    subscribers: SubscriberMap,
}

impl Subscription {
    /// Next event, or `None` once the broker stopped.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

// Lets an SSE handler drive the subscription as a stream; dropping the
// stream (client disconnect) deregisters the subscriber.
impl futures::Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
