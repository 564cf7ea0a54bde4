use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::database::Database;
use crate::errors::{AppError, Result, SourceClientError};
use crate::models::*;
use crate::schedule::compute_schedule;
use crate::sources::SourceClient;

/// Fields on a source that feed schedule derivation. An update not
/// touching any of them is a validated skip.
const SCHEDULE_FIELDS: [&str; 3] = ["rate_limit", "max_depth", "priority"];

/// Translates source lifecycle events into idempotent job mutations.
#[derive(Clone)]
pub struct EventService {
    database: Database,
    sources: Arc<dyn SourceClient>,
    defaults: JobsConfig,
}

impl EventService {
    pub fn new(database: Database, sources: Arc<dyn SourceClient>, defaults: JobsConfig) -> Self {
        Self {
            database,
            sources,
            defaults,
        }
    }

    /// Apply one event. Replays are no-ops; transient failures leave
    /// the ledger untouched so the stream redelivers.
    pub async fn handle_event(&self, event: &SourceEvent) -> Result<()> {
        if self.database.is_event_processed(event.event_id).await? {
            debug!(event_id = %event.event_id, "event already processed, skipping");
            return Ok(());
        }

        let result = match event.event_type {
            SourceEventType::SourceCreated => self.handle_source_created(event).await,
            SourceEventType::SourceUpdated => self.handle_source_updated(event).await,
            SourceEventType::SourceDeleted => self.handle_source_deleted(event).await,
            SourceEventType::SourceEnabled => self.handle_source_enabled(event).await,
            SourceEventType::SourceDisabled => self.handle_source_disabled(event).await,
        };

        match result {
            // A concurrent consumer recorded the same event first; the
            // effect already happened exactly once.
            Err(AppError::Duplicate { .. }) => Ok(()),
            other => other,
        }
    }

    async fn handle_source_created(&self, event: &SourceEvent) -> Result<()> {
        if event.payload.enabled == Some(false) {
            debug!(source_id = %event.source_id, "source created disabled, skipping");
            return self.database.record_processed_event(event.event_id).await;
        }

        let url = match &event.payload.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => {
                self.database.record_processed_event(event.event_id).await?;
                return Err(AppError::validation(format!(
                    "source.created event {} has no url",
                    event.event_id
                )));
            }
        };
        if let Err(e) = url::Url::parse(&url) {
            self.database.record_processed_event(event.event_id).await?;
            return Err(AppError::validation(format!(
                "source.created event {} has invalid url: {e}",
                event.event_id
            )));
        }

        let priority = SourcePriority::parse(event.payload.priority.as_deref().unwrap_or(""));
        let params = compute_schedule(
            event.payload.rate_limit.unwrap_or(0),
            event.payload.max_depth.unwrap_or(0),
            priority,
            0,
        );

        let now = Utc::now();
        let job = self.new_auto_job(
            event.source_id,
            event.payload.name.clone().unwrap_or_default(),
            url,
            &params,
            now + params.initial_delay,
        );

        let job = self
            .database
            .record_event_and_upsert_job(event.event_id, &job)
            .await?;
        info!(
            job_id = %job.id, source_id = %event.source_id,
            interval_minutes = ?job.interval_minutes,
            "created job for new source"
        );
        Ok(())
    }

    async fn handle_source_updated(&self, event: &SourceEvent) -> Result<()> {
        let relevant = event
            .payload
            .changed_fields
            .iter()
            .any(|f| SCHEDULE_FIELDS.contains(&f.as_str()));
        if !relevant {
            debug!(source_id = %event.source_id, "update touched no schedule fields, skipping");
            return self.database.record_processed_event(event.event_id).await;
        }

        let source = match self.sources.get_source(event.source_id).await {
            Ok(source) => source,
            Err(SourceClientError::NotFound(_)) => {
                debug!(source_id = %event.source_id, "updated source no longer exists, skipping");
                return self.database.record_processed_event(event.event_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        let Some(mut job) = self.database.find_job_by_source_id(event.source_id).await? else {
            debug!(source_id = %event.source_id, "no job for updated source, skipping");
            return self.database.record_processed_event(event.event_id).await;
        };

        // Recompute with the job's current failure count so an active
        // backoff is not silently discarded. next_run_at stays put; a
        // reschedule takes effect from the next completed run.
        let params = compute_schedule(
            source.rate_limit,
            source.max_depth,
            source.priority,
            job.failure_count,
        );
        job.interval_minutes = Some(params.interval_minutes);
        job.interval_type = params.interval_type;
        job.priority = params.numeric_priority;
        job.source_name = source.name;

        let job = self
            .database
            .record_event_and_upsert_job(event.event_id, &job)
            .await?;
        info!(
            job_id = %job.id, source_id = %event.source_id,
            interval_minutes = ?job.interval_minutes,
            "rescheduled job after source update"
        );
        Ok(())
    }

    async fn handle_source_deleted(&self, event: &SourceEvent) -> Result<()> {
        let deleted = self
            .database
            .record_event_and_delete_jobs(event.event_id, event.source_id)
            .await?;
        info!(source_id = %event.source_id, deleted, "deleted jobs for removed source");
        Ok(())
    }

    async fn handle_source_enabled(&self, event: &SourceEvent) -> Result<()> {
        let now = Utc::now();

        if let Some(mut job) = self.database.find_job_by_source_id(event.source_id).await? {
            job.status = JobStatus::Pending;
            job.is_paused = false;
            job.next_run_at = Some(now);
            let job = self
                .database
                .record_event_and_upsert_job(event.event_id, &job)
                .await?;
            info!(job_id = %job.id, source_id = %event.source_id, "resumed job for enabled source");
            return Ok(());
        }

        // No job yet; build one from the authoritative source record.
        let source = match self.sources.get_source(event.source_id).await {
            Ok(source) => source,
            Err(SourceClientError::NotFound(_)) => {
                warn!(source_id = %event.source_id, "enabled source not found in catalog, skipping");
                return self.database.record_processed_event(event.event_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        let params = compute_schedule(source.rate_limit, source.max_depth, source.priority, 0);
        let job = self.new_auto_job(source.id, source.name, source.url, &params, now);
        let job = self
            .database
            .record_event_and_upsert_job(event.event_id, &job)
            .await?;
        info!(job_id = %job.id, source_id = %event.source_id, "created job for enabled source");
        Ok(())
    }

    async fn handle_source_disabled(&self, event: &SourceEvent) -> Result<()> {
        let paused = self
            .database
            .record_event_and_update_status(event.event_id, event.source_id, JobStatus::Paused)
            .await?;
        info!(source_id = %event.source_id, paused, "paused jobs for disabled source");
        Ok(())
    }

    fn new_auto_job(
        &self,
        source_id: Uuid,
        source_name: String,
        url: String,
        params: &crate::schedule::ScheduleParams,
        next_run_at: chrono::DateTime<Utc>,
    ) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            source_id,
            source_name,
            url,
            auto_managed: true,
            interval_minutes: Some(params.interval_minutes),
            interval_type: params.interval_type,
            priority: params.numeric_priority,
            next_run_at: Some(next_run_at),
            status: JobStatus::Pending,
            schedule_enabled: true,
            is_paused: false,
            failure_count: 0,
            max_retries: self.defaults.default_max_retries,
            retry_backoff_seconds: self.defaults.default_retry_backoff_seconds,
            scheduler_version: 1,
            migration_status: MigrationStatus::None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MemorySourceClient;
    use async_trait::async_trait;
    use chrono::Duration;

    fn defaults() -> JobsConfig {
        JobsConfig {
            default_max_retries: 3,
            default_retry_backoff_seconds: 60,
        }
    }

    fn created_event(source_id: Uuid) -> SourceEvent {
        SourceEvent {
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
        }
    }

    async fn service_fixture() -> (EventService, Database, MemorySourceClient) {
        let db = Database::new_in_memory().await.unwrap();
        let sources = MemorySourceClient::new();
        let service = EventService::new(db.clone(), Arc::new(sources.clone()), defaults());
        (service, db, sources)
    }

    #[tokio::test]
    async fn source_created_builds_scheduled_job() {
        let (service, db, _) = service_fixture().await;
        let source_id = Uuid::new_v4();
        let before = Utc::now();

        service.handle_event(&created_event(source_id)).await.unwrap();

        let job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
        assert!(job.auto_managed);
        assert_eq!(job.interval_minutes, Some(60));
        assert_eq!(job.priority, 50);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.schedule_enabled);
        assert_eq!(job.max_retries, 3);

        // Normal priority staggers the first run by five minutes.
        let next_run = job.next_run_at.unwrap();
        assert!(next_run >= before + Duration::minutes(4));
        assert!(next_run <= Utc::now() + Duration::minutes(6));
    }

    #[tokio::test]
    async fn source_created_disabled_records_without_job() {
        let (service, db, _) = service_fixture().await;
        let source_id = Uuid::new_v4();
        let mut event = created_event(source_id);
        event.payload.enabled = Some(false);

        service.handle_event(&event).await.unwrap();

        assert!(db.find_job_by_source_id(source_id).await.unwrap().is_none());
        assert!(db.is_event_processed(event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn source_created_invalid_url_is_recorded_and_rejected() {
        let (service, db, _) = service_fixture().await;
        let mut event = created_event(Uuid::new_v4());
        event.payload.url = Some("not a url".to_string());

        let err = service.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        // Recorded so the stream will not retry a hopeless payload.
        assert!(db.is_event_processed(event.event_id).await.unwrap());

        // Redelivery is now a no-op.
        service.handle_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn replayed_event_has_single_effect() {
        let (service, db, _) = service_fixture().await;
        let source_id = Uuid::new_v4();
        let event = created_event(source_id);

        service.handle_event(&event).await.unwrap();
        service.handle_event(&event).await.unwrap();

        let filter = JobFilter {
            source_id: Some(source_id),
            ..Default::default()
        };
        assert_eq!(db.count_jobs(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_limit_update_recomputes_interval_without_touching_deadline() {
        let (service, db, sources) = service_fixture().await;
        let source_id = Uuid::new_v4();
        service.handle_event(&created_event(source_id)).await.unwrap();
        let original = db.find_job_by_source_id(source_id).await.unwrap().unwrap();

        sources
            .insert(Source {
                id: source_id,
                name: "Acme".to_string(),
                url: "https://acme.example/feed".to_string(),
                rate_limit: 3,
                max_depth: 2,
                priority: SourcePriority::Normal,
                enabled: true,
            })
            .await;

        let event = SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceUpdated,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload {
                changed_fields: vec!["rate_limit".to_string()],
                ..Default::default()
            },
        };
        service.handle_event(&event).await.unwrap();

        let job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
        assert_eq!(job.interval_minutes, Some(90));
        assert_eq!(job.priority, 50);
        assert_eq!(
            job.next_run_at.map(|d| d.timestamp()),
            original.next_run_at.map(|d| d.timestamp()),
            "deadline must survive a reschedule"
        );
        assert_eq!(job.id, original.id);
    }

    #[tokio::test]
    async fn update_without_schedule_fields_is_recorded_skip() {
        let (service, db, _) = service_fixture().await;
        let source_id = Uuid::new_v4();
        service.handle_event(&created_event(source_id)).await.unwrap();
        let original = db.find_job_by_source_id(source_id).await.unwrap().unwrap();

        let event = SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceUpdated,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload {
                changed_fields: vec!["name".to_string()],
                ..Default::default()
            },
        };
        service.handle_event(&event).await.unwrap();

        let job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
        assert_eq!(job.interval_minutes, original.interval_minutes);
        assert!(db.is_event_processed(event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn disable_then_enable_round_trip() {
        let (service, db, sources) = service_fixture().await;
        let source_id = Uuid::new_v4();
        service.handle_event(&created_event(source_id)).await.unwrap();
        sources
            .insert(Source {
                id: source_id,
                name: "Acme".to_string(),
                url: "https://acme.example/feed".to_string(),
                rate_limit: 10,
                max_depth: 2,
                priority: SourcePriority::Normal,
                enabled: true,
            })
            .await;

        let disable = SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceDisabled,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload::default(),
        };
        service.handle_event(&disable).await.unwrap();

        let job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert!(job.is_paused);

        let enable = SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceEnabled,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload::default(),
        };
        let before = Utc::now();
        service.handle_event(&enable).await.unwrap();

        let job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_paused);
        let next_run = job.next_run_at.unwrap();
        assert!(next_run >= before - Duration::seconds(1));
        assert!(next_run <= Utc::now() + Duration::seconds(1));
    }

    #[tokio::test]
    async fn enable_without_job_creates_from_catalog() {
        let (service, db, sources) = service_fixture().await;
        let source_id = Uuid::new_v4();
        sources
            .insert(Source {
                id: source_id,
                name: "Beta".to_string(),
                url: "https://beta.example/feed".to_string(),
                rate_limit: 10,
                max_depth: 2,
                priority: SourcePriority::High,
                enabled: true,
            })
            .await;

        let enable = SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceEnabled,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload::default(),
        };
        service.handle_event(&enable).await.unwrap();

        let job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
        assert_eq!(job.source_name, "Beta");
        assert_eq!(job.priority, 75);
        assert_eq!(job.interval_minutes, Some(30));
    }

    #[tokio::test]
    async fn deleted_source_removes_job() {
        let (service, db, _) = service_fixture().await;
        let source_id = Uuid::new_v4();
        service.handle_event(&created_event(source_id)).await.unwrap();

        let delete = SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceDeleted,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload::default(),
        };
        service.handle_event(&delete).await.unwrap();

        assert!(db.find_job_by_source_id(source_id).await.unwrap().is_none());
        assert!(db.is_event_processed(delete.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn transient_source_client_failure_leaves_ledger_untouched() {
        struct FlakyClient;
        #[async_trait]
        impl SourceClient for FlakyClient {
            async fn get_source(&self, _id: Uuid) -> std::result::Result<Source, SourceClientError> {
                Err(SourceClientError::Unavailable {
                    message: "502".to_string(),
                })
            }
        }

        let db = Database::new_in_memory().await.unwrap();
        let service = EventService::new(db.clone(), Arc::new(FlakyClient), defaults());
        let source_id = Uuid::new_v4();
        service.handle_event(&created_event(source_id)).await.unwrap();

        let event = SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceUpdated,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload {
                changed_fields: vec!["priority".to_string()],
                ..Default::default()
            },
        };

        let err = service.handle_event(&event).await.unwrap_err();
        assert!(err.is_transient());
        // Not recorded, so redelivery can still apply the effect.
        assert!(!db.is_event_processed(event.event_id).await.unwrap());
    }
}
