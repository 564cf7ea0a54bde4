//! End-to-end lifecycle tests: source events feeding the repository,
//! the scheduler picking work up, and write-backs racing catalog
//! mutations.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crawl_orchestrator::config::{JobsConfig, SchedulerConfig};
use crawl_orchestrator::crawler::{CrawlOutcome, Crawler, CrawlerFactory};
use crawl_orchestrator::database::Database;
use crawl_orchestrator::errors::Result;
use crawl_orchestrator::events::EventService;
use crawl_orchestrator::models::*;
use crawl_orchestrator::scheduler::IntervalScheduler;
use crawl_orchestrator::sources::MemorySourceClient;

struct StubCrawler {
    delay: Duration,
}

#[async_trait]
impl Crawler for StubCrawler {
    async fn start(&mut self, _token: CancellationToken, _source_id: &str) -> Result<()> {
        Ok(())
    }

    async fn wait(&mut self) -> Result<CrawlOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(CrawlOutcome {
            items_crawled: 3,
            items_indexed: 3,
        })
    }
}

struct StubFactory {
    delay: Duration,
}

impl CrawlerFactory for StubFactory {
    fn create(&self) -> Box<dyn Crawler> {
        Box::new(StubCrawler { delay: self.delay })
    }
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_seconds: 1,
        reload_interval_seconds: 300,
        concurrency: 4,
        execution_timeout_seconds: 10,
        shutdown_timeout_seconds: 2,
    }
}

fn jobs_config() -> JobsConfig {
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

async fn wait_for_status(db: &Database, job_id: Uuid, status: JobStatus) -> bool {
    for _ in 0..200 {
        if db
            .get_job(job_id)
            .await
            .unwrap()
            .map(|j| j.status == status)
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn create_event_then_tick_runs_the_job() {
    let db = Database::new_in_memory().await.unwrap();
    let sources = MemorySourceClient::new();
    let service = EventService::new(db.clone(), Arc::new(sources.clone()), jobs_config());

    let source_id = Uuid::new_v4();
    service.handle_event(&created_event(source_id)).await.unwrap();

    let job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
    assert_eq!(job.interval_minutes, Some(60));
    assert_eq!(job.priority, 50);
    assert_eq!(job.status, JobStatus::Pending);

    // The initial delay keeps the job out of the first tick.
    let scheduler = IntervalScheduler::new(
        db.clone(),
        Arc::new(StubFactory {
            delay: Duration::from_millis(0),
        }),
        Arc::new(sources),
        None,
        None,
        scheduler_config(),
    );
    scheduler.tick_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        db.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    // Advance the clock by moving the deadline into the past.
    let mut due = db.get_job(job.id).await.unwrap().unwrap();
    due.next_run_at = Some(Utc::now() - ChronoDuration::seconds(1));
    db.update_job(&due).await.unwrap();

    scheduler.tick_once().await.unwrap();
    assert!(wait_for_status(&db, job.id, JobStatus::Completed).await);

    let finished = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(finished.failure_count, 0);
    let next_run = finished.next_run_at.unwrap();
    let expected = Utc::now() + ChronoDuration::minutes(60);
    assert!((next_run - expected).num_seconds().abs() < 10);

    let executions = db.list_executions(job.id, 10, 0).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].items_crawled, 3);
}

#[tokio::test]
async fn source_deleted_during_run_is_not_resurrected() {
    let db = Database::new_in_memory().await.unwrap();
    let sources = MemorySourceClient::new();
    let service = EventService::new(db.clone(), Arc::new(sources.clone()), jobs_config());

    let source_id = Uuid::new_v4();
    service.handle_event(&created_event(source_id)).await.unwrap();
    let mut job = db.find_job_by_source_id(source_id).await.unwrap().unwrap();
    job.next_run_at = Some(Utc::now() - ChronoDuration::seconds(1));
    db.update_job(&job).await.unwrap();

    let scheduler = IntervalScheduler::new(
        db.clone(),
        Arc::new(StubFactory {
            delay: Duration::from_millis(300),
        }),
        Arc::new(sources),
        None,
        None,
        scheduler_config(),
    );
    scheduler.tick_once().await.unwrap();
    assert!(wait_for_status(&db, job.id, JobStatus::Running).await);

    // The source disappears mid-run.
    service
        .handle_event(&SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceDeleted,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload::default(),
        })
        .await
        .unwrap();
    assert!(db.get_job(job.id).await.unwrap().is_none());

    // The execution finishes; the write-back must not bring the row back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(db.get_job(job.id).await.unwrap().is_none());
    assert!(db.find_job_by_source_id(source_id).await.unwrap().is_none());
}

#[tokio::test]
async fn replayed_stream_yields_identical_state() {
    let db = Database::new_in_memory().await.unwrap();
    let sources = MemorySourceClient::new();
    let service = EventService::new(db.clone(), Arc::new(sources.clone()), jobs_config());

    let source_id = Uuid::new_v4();
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

    let events = vec![
        created_event(source_id),
        SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceUpdated,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload {
                changed_fields: vec!["rate_limit".to_string()],
                ..Default::default()
            },
        },
        SourceEvent {
            event_id: Uuid::new_v4(),
            event_type: SourceEventType::SourceDisabled,
            source_id,
            timestamp: Utc::now(),
            payload: SourceEventPayload::default(),
        },
    ];

    for event in &events {
        service.handle_event(event).await.unwrap();
    }
    let after_first_pass = db.find_job_by_source_id(source_id).await.unwrap().unwrap();

    // Replaying the whole stream must change nothing.
    for event in &events {
        service.handle_event(event).await.unwrap();
    }
    let after_replay = db.find_job_by_source_id(source_id).await.unwrap().unwrap();

    assert_eq!(after_replay.id, after_first_pass.id);
    assert_eq!(after_replay.status, after_first_pass.status);
    assert_eq!(after_replay.interval_minutes, after_first_pass.interval_minutes);
    assert_eq!(after_replay.failure_count, after_first_pass.failure_count);
    assert_eq!(
        after_replay.scheduler_version,
        after_first_pass.scheduler_version
    );
    assert_eq!(after_replay.status, JobStatus::Paused);
    assert_eq!(after_replay.interval_minutes, Some(90));
}
