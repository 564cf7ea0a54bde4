//! SSE endpoints for lifecycle events and per-job log streaming.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tokio_stream::StreamExt;
use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::errors::{AppError, Result};
use crate::sse::{StreamEvent, StreamEventType, SubscriptionFilter};

#[derive(Debug, Deserialize)]
pub struct EventStreamParams {
    /// Comma-separated event types, e.g. `job.started,job.failed`.
    pub types: Option<String>,
    pub job_id: Option<Uuid>,
}

fn parse_event_type(raw: &str) -> Result<StreamEventType> {
    match raw.trim() {
        "job.started" => Ok(StreamEventType::JobStarted),
        "job.completed" => Ok(StreamEventType::JobCompleted),
        "job.failed" => Ok(StreamEventType::JobFailed),
        "job.cancelled" => Ok(StreamEventType::JobCancelled),
        "log.line" => Ok(StreamEventType::LogLine),
        other => Err(AppError::validation(format!("unknown event type '{other}'"))),
    }
}

fn sse_response(
    stream: impl Stream<Item = StreamEvent> + Send + 'static,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = stream.filter_map(|event| match Event::default().json_data(&event) {
        Ok(sse_event) => Some(Ok::<_, Infallible>(sse_event)),
        Err(e) => {
            debug!("failed to serialize stream event: {e}");
            None
        }
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

/// Live lifecycle events, optionally narrowed by type and job.
pub async fn events_stream(
    State(state): State<AppState>,
    Query(params): Query<EventStreamParams>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let event_types = match &params.types {
        Some(raw) if !raw.is_empty() => {
            let mut set = HashSet::new();
            for part in raw.split(',') {
                set.insert(parse_event_type(part)?);
            }
            Some(set)
        }
        _ => None,
    };

    let subscription = state.broker.subscribe(SubscriptionFilter {
        event_types,
        job_id: params.job_id,
    });
    Ok(sse_response(subscription))
}

/// Live log lines for one job.
pub async fn job_logs_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    if state.database.get_job(id).await?.is_none() {
        return Err(AppError::not_found("job", id.to_string()));
    }

    let subscription = state.broker.subscribe(SubscriptionFilter {
        event_types: Some([StreamEventType::LogLine].into_iter().collect()),
        job_id: Some(id),
    });
    Ok(sse_response(subscription))
}
