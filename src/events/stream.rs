use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::errors::{AppError, Result};
use crate::models::SourceEvent;

/// Upstream event stream capability. Delivery is at-least-once and
/// ordered per source; one logical reader exists per consumer group.
#[async_trait]
pub trait EventStreamClient: Send + Sync {
    async fn subscribe(&self, group: &str) -> Result<EventSubscription>;
}

/// A consumer's end of the stream.
pub struct EventSubscription {
    rx: mpsc::Receiver<SourceEvent>,
}

impl EventSubscription {
    pub fn new(rx: mpsc::Receiver<SourceEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the stream closed.
    pub async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }
}

/// In-process stream backed by a bounded channel. Stands in for an
/// external log (consumer-group) client in tests and single-node
/// deployments; ordering per source follows from the single channel.
pub struct ChannelEventStream {
    tx: mpsc::Sender<SourceEvent>,
    rx: Mutex<Option<mpsc::Receiver<SourceEvent>>>,
}

impl ChannelEventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: self.tx.clone(),
        }
    }
}

#[async_trait]
impl EventStreamClient for ChannelEventStream {
    async fn subscribe(&self, group: &str) -> Result<EventSubscription> {
        debug!(group, "subscribing to source event stream");
        let rx = self.rx.lock().await.take().ok_or_else(|| {
            AppError::fatal(format!("consumer group '{group}' already has a reader"))
        })?;
        Ok(EventSubscription::new(rx))
    }
}

/// Handle for emitting events into the stream, e.g. from an ingress
/// webhook or a test.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<SourceEvent>,
}

impl EventPublisher {
    pub async fn publish(&self, event: SourceEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AppError::transient("event stream closed"))
    }
}
