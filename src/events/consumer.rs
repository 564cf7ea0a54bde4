use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::service::EventService;
use super::stream::EventStreamClient;
use crate::errors::Result;
use crate::models::SourceEvent;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Single serial reader over the source event stream.
///
/// Events are applied one at a time; a transient failure retries the
/// same event with growing delay rather than advancing past it, which
/// preserves per-source ordering.
pub struct EventConsumer {
    service: EventService,
    stream: Arc<dyn EventStreamClient>,
    group: String,
}

impl EventConsumer {
    pub fn new(service: EventService, stream: Arc<dyn EventStreamClient>, group: String) -> Self {
        Self {
            service,
            stream,
            group,
        }
    }

    /// Spawn the consumer loop. The task drains until the stream closes
    /// or the token fires.
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(token).await {
                error!("event consumer stopped with error: {e}");
            }
        })
    }

    async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(group = %self.group, "starting event consumer");
        let mut subscription = self.stream.subscribe(&self.group).await?;

        loop {
            tokio::select! {
                maybe_event = subscription.next() => {
                    match maybe_event {
                        Some(event) => self.apply_with_retry(event, &token).await,
                        None => {
                            info!("event stream closed, stopping consumer");
                            break;
                        }
                    }
                }
                _ = token.cancelled() => {
                    info!("event consumer received cancellation signal");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn apply_with_retry(&self, event: SourceEvent, token: &CancellationToken) {
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            match self.service.handle_event(&event).await {
                Ok(()) => return,
                Err(e) if e.is_transient() => {
                    warn!(
                        event_id = %event.event_id,
                        "transient failure applying event, retrying in {delay:?}: {e}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return,
                    }
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => {
                    // Validation and not-found errors were already
                    // recorded by the service; retrying cannot help.
                    error!(event_id = %event.event_id, "dropping unprocessable event: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::database::Database;
    use crate::events::stream::ChannelEventStream;
    use crate::models::*;
    use crate::sources::MemorySourceClient;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn consumer_applies_events_from_stream() {
        let db = Database::new_in_memory().await.unwrap();
        let service = EventService::new(
            db.clone(),
            Arc::new(MemorySourceClient::new()),
            JobsConfig {
                default_max_retries: 3,
                default_retry_backoff_seconds: 60,
            },
        );
        let stream = Arc::new(ChannelEventStream::new(16));
        let publisher = stream.publisher();

        let token = CancellationToken::new();
        let consumer = EventConsumer::new(service, stream, "test-group".to_string());
        let handle = consumer.start(token.clone());

        let source_id = Uuid::new_v4();
        publisher
            .publish(SourceEvent {
                event_id: Uuid::new_v4(),
                event_type: SourceEventType::SourceCreated,
                source_id,
                timestamp: Utc::now(),
                payload: SourceEventPayload {
                    name: Some("Acme".to_string()),
                    url: Some("https://acme.example/feed".to_string()),
                    rate_limit: Some(10),
                    max_depth: Some(2),
                    priority: Some("normal".to_string()),
                    enabled: Some(true),
                    changed_fields: Vec::new(),
                },
            })
            .await
            .unwrap();

        // Wait for the consumer to materialize the job.
        let mut job = None;
        for _ in 0..50 {
            if let Some(found) = db.find_job_by_source_id(source_id).await.unwrap() {
                job = Some(found);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = job.expect("consumer should have created the job");
        assert_eq!(job.interval_minutes, Some(60));

        token.cancel();
        handle.await.unwrap();
    }
}
