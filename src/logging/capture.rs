//! Tracing bridge into per-execution log capture.
//!
//! A custom layer that watches for events carrying an `execution_id`
//! field and routes them into the owning execution's ring buffer, so
//! ordinary `tracing` calls made while a crawl runs show up in the
//! job's log stream.

use std::collections::HashMap;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;
use uuid::Uuid;

use super::{LogLevel, LogService};

pub struct ExecutionCaptureLayer {
    service: LogService,
}

impl ExecutionCaptureLayer {
    pub fn new(service: LogService) -> Self {
        Self { service }
    }
}

impl<S> Layer<S> for ExecutionCaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Skip events from the capture machinery itself to avoid
        // recursing through sink-failure warnings.
        if event
            .metadata()
            .target()
            .starts_with("crawl_orchestrator::logging")
        {
            return;
        }

        // Only events tagged with an execution are captured; everything
        // else belongs to the regular fmt output.
        let mut fields = HashMap::new();
        let mut visitor = FieldVisitor::new(&mut fields);
        event.record(&mut visitor);

        let Some(execution_id) = fields
            .get("execution_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        else {
            return;
        };

        let message = fields
            .remove("message")
            .unwrap_or_else(|| event.metadata().name().to_string());
        fields.remove("execution_id");

        let level = LogLevel::parse(&event.metadata().level().to_string())
            .unwrap_or(LogLevel::Info);

        self.service.append(execution_id, level, &message, fields);
    }
}

/// Field visitor extracting structured data from tracing events.
struct FieldVisitor<'a> {
    fields: &'a mut HashMap<String, String>,
}

impl<'a> FieldVisitor<'a> {
    fn new(fields: &'a mut HashMap<String, String>) -> Self {
        Self { fields }
    }
}

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let formatted = format!("{value:?}");
        // Strip the quotes Debug puts around plain strings.
        let clean = if formatted.starts_with('"') && formatted.ends_with('"') && formatted.len() > 1
        {
            formatted[1..formatted.len() - 1].to_string()
        } else {
            formatted
        };
        self.fields.insert(field.name().to_string(), clean);
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogsConfig;
    use chrono::Utc;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn routes_tagged_events_into_execution_buffer() {
        let config = LogsConfig {
            buffer_size: 16,
            min_level: "info".to_string(),
            stream_enabled: false,
            stream_ttl_seconds: 60,
            archive_enabled: false,
            archive_bucket: "crawl-logs".to_string(),
        };
        let service = LogService::new(&config, None, None, None);
        let execution_id = Uuid::new_v4();
        service.attach_execution(execution_id, Uuid::new_v4(), Utc::now());

        let subscriber = tracing_subscriber::registry()
            .with(ExecutionCaptureLayer::new(service.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(execution_id = %execution_id, pages = 3, "fetched batch");
            tracing::info!("untagged event stays out");
        });

        let entries = service.logs_for_execution(execution_id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "fetched batch");
        assert_eq!(entries[0].fields.get("pages").map(String::as_str), Some("3"));
    }
}
