//! Interval-based job scheduler.
//!
//! One instance per process. Three cooperative workers share the
//! repository: the tick worker launches due jobs, the reload worker
//! reconciles derived in-memory state with the repository, and the
//! immediate worker drains one-shot manual runs. Executions run
//! concurrently up to a semaphore cap, each under a child cancellation
//! scope of the scheduler's root scope.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::crawler::{CrawlOutcome, CrawlerFactory};
use crate::database::Database;
use crate::errors::{AppError, Result};
use crate::logging::LogService;
use crate::models::*;
use crate::schedule::{compute_schedule, MAX_INTERVAL_MINUTES};
use crate::sources::SourceClient;
use crate::sse::{SseBroker, StreamEvent};

/// Upper bound on jobs pulled per tick; saturation leaves the rest for
/// the next iteration.
const DUE_BATCH_LIMIT: i64 = 50;

enum RunResult {
    Completed(CrawlOutcome),
    Failed(String),
    Cancelled,
}

struct SchedulerInner {
    database: Database,
    crawler_factory: Arc<dyn CrawlerFactory>,
    sources: Arc<dyn SourceClient>,
    broker: Option<SseBroker>,
    logs: Option<LogService>,
    config: SchedulerConfig,
    token: CancellationToken,
    active_jobs: RwLock<HashMap<Uuid, CancellationToken>>,
    semaphore: Arc<Semaphore>,
    tick_nudge: tokio::sync::Notify,
}

impl SchedulerInner {
    fn publish(&self, event: StreamEvent) {
        if let Some(broker) = &self.broker {
            broker.publish(event);
        }
    }
}

/// Scheduler handle. Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct IntervalScheduler {
    inner: Arc<SchedulerInner>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    workers: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl IntervalScheduler {
    pub fn new(
        database: Database,
        crawler_factory: Arc<dyn CrawlerFactory>,
        sources: Arc<dyn SourceClient>,
        broker: Option<SseBroker>,
        logs: Option<LogService>,
        config: SchedulerConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                database,
                crawler_factory,
                sources,
                broker,
                logs,
                config,
                token: CancellationToken::new(),
                active_jobs: RwLock::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(concurrency)),
                tick_nudge: tokio::sync::Notify::new(),
            }),
            started: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            workers: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Spawn the workers. Returns immediately; calling twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            concurrency = self.inner.config.concurrency,
            tick_seconds = self.inner.config.tick_interval_seconds,
            "starting interval scheduler"
        );

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.push(tokio::spawn(Self::tick_worker(self.clone())));
        workers.push(tokio::spawn(Self::reload_worker(self.clone())));
        workers.push(tokio::spawn(Self::immediate_worker(self.clone())));
    }

    /// Cancel the root scope and wait for active executions to reach a
    /// terminal state, bounded by the shutdown timeout. Executions still
    /// running at the deadline are abandoned; the reload sweep of a
    /// later process reconciles their rows.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping interval scheduler");
        self.inner.token.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_timeout();
        loop {
            let active = self.inner.active_jobs.read().await.len();
            if active == 0 {
                info!("all executions reached a terminal state");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "shutdown deadline reached, abandoning executions");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    async fn tick_worker(scheduler: IntervalScheduler) {
        let mut ticker = interval(scheduler.inner.config.tick_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = scheduler.inner.tick_nudge.notified() => {}
                _ = scheduler.inner.token.cancelled() => {
                    debug!("tick worker received cancellation signal");
                    return;
                }
            }
            if let Err(e) = scheduler.tick_once().await {
                error!("tick failed: {e}");
            }
        }
    }

    async fn reload_worker(scheduler: IntervalScheduler) {
        let mut ticker = interval(scheduler.inner.config.reload_interval());
        // The first tick fires immediately; skip it so startup does not
        // race the initial job launches.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = scheduler.inner.token.cancelled() => {
                    debug!("reload worker received cancellation signal");
                    return;
                }
            }
            if let Err(e) = scheduler.reload_once().await {
                error!("reload sweep failed: {e}");
            }
        }
    }

    async fn immediate_worker(scheduler: IntervalScheduler) {
        let mut ticker = interval(scheduler.inner.config.tick_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = scheduler.inner.token.cancelled() => {
                    debug!("immediate worker received cancellation signal");
                    return;
                }
            }
            if let Err(e) = scheduler.run_immediate_once().await {
                error!("one-shot pass failed: {e}");
            }
        }
    }

    /// One scheduling iteration: select due jobs and launch what the
    /// concurrency cap allows.
    pub async fn tick_once(&self) -> Result<()> {
        let now = Utc::now();
        let due = self.inner.database.find_due_jobs(now, DUE_BATCH_LIMIT).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "found due jobs");

        for job in due {
            self.try_launch(job).await;
        }
        Ok(())
    }

    /// One pass over one-shot manual runs (gate disabled, pending).
    pub async fn run_immediate_once(&self) -> Result<()> {
        let jobs = self.inner.database.find_one_shot_jobs(DUE_BATCH_LIMIT).await?;
        for job in jobs {
            self.try_launch(job).await;
        }
        Ok(())
    }

    /// Reconcile derived state: drop active entries whose job vanished
    /// and reconcile `running` rows nobody in this process owns.
    pub async fn reload_once(&self) -> Result<()> {
        let stale_entries: Vec<(Uuid, CancellationToken)> = {
            let active = self.inner.active_jobs.read().await;
            let mut gone = Vec::new();
            for (job_id, token) in active.iter() {
                if self.inner.database.get_job(*job_id).await?.is_none() {
                    gone.push((*job_id, token.clone()));
                }
            }
            gone
        };
        for (job_id, token) in stale_entries {
            warn!(job_id = %job_id, "active job no longer exists, cancelling execution");
            token.cancel();
            self.inner.active_jobs.write().await.remove(&job_id);
        }

        let running = self.inner.database.find_running_jobs().await?;
        let now = Utc::now();
        for job in running {
            let owned = self.inner.active_jobs.read().await.contains_key(&job.id);
            if !owned {
                self.inner.database.mark_job_stale(job.id, now).await?;
            }
        }
        Ok(())
    }

    /// Execution protocol steps a-e: slot, version check, execution row,
    /// registration, event. The remaining steps run in a spawned task.
    async fn try_launch(&self, job: Job) {
        if self.inner.active_jobs.read().await.contains_key(&job.id) {
            debug!(job_id = %job.id, "job already executing, skipping");
            return;
        }

        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("concurrency cap saturated, leaving remainder for next tick");
                return;
            }
        };

        let started_at = Utc::now();
        match self
            .inner
            .database
            .mark_job_running(job.id, job.scheduler_version, started_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "job changed since selection, dropping decision");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, "failed to mark job running: {e}");
                return;
            }
        }

        let execution = match self.inner.database.create_execution(job.id, started_at).await {
            Ok(execution) => execution,
            Err(e) => {
                error!(job_id = %job.id, "failed to create execution: {e}");
                return;
            }
        };

        let exec_token = self.inner.token.child_token();
        self.inner
            .active_jobs
            .write()
            .await
            .insert(job.id, exec_token.clone());

        if let Some(logs) = &self.inner.logs {
            logs.attach_execution(execution.id, job.id, started_at);
        }
        self.inner
            .publish(StreamEvent::job_started(job.id, execution.id));
        info!(
            job_id = %job.id, execution_id = %execution.id, source_id = %job.source_id,
            "starting job execution"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            Self::execute(inner, job, execution, exec_token, permit).await;
        });
    }

    /// Execution protocol steps f-j.
    async fn execute(
        inner: Arc<SchedulerInner>,
        job: Job,
        execution: Execution,
        token: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let source_id = job.source_id.to_string();
        let crawl = Self::run_crawl(inner.crawler_factory.as_ref(), token.clone(), source_id);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => RunResult::Cancelled,
            res = crawl => match res {
                Ok(outcome) => RunResult::Completed(outcome),
                Err(e) => RunResult::Failed(e.to_string()),
            },
            _ = tokio::time::sleep(inner.config.execution_timeout()) => {
                RunResult::Failed(format!(
                    "execution timed out after {}s",
                    inner.config.execution_timeout_seconds
                ))
            }
        };
        // Stop any crawl work still in flight (timeout and failure paths).
        token.cancel();

        let finished_at = Utc::now();
        // Re-read the row: an event may have rescheduled or deleted the
        // job while the crawl ran; the write-back must see that.
        let fresh = match inner.database.get_job(job.id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(job_id = %job.id, "failed to re-read job after run: {e}");
                None
            }
        };
        let current = fresh.as_ref().unwrap_or(&job);

        match result {
            RunResult::Completed(outcome) => {
                let next_run_at = if current.schedule_enabled {
                    current
                        .interval_minutes
                        .map(|m| finished_at + ChronoDuration::minutes(m))
                } else {
                    None
                };
                if let Err(e) = inner
                    .database
                    .finish_execution(
                        execution.id,
                        ExecutionStatus::Completed,
                        outcome.items_crawled,
                        outcome.items_indexed,
                        None,
                    )
                    .await
                {
                    error!(execution_id = %execution.id, "failed to seal execution: {e}");
                }
                match inner
                    .database
                    .finish_job_success(job.id, finished_at, next_run_at)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(job_id = %job.id, "job deleted during run, not resurrecting"),
                    Err(e) => error!(job_id = %job.id, "failed to record success: {e}"),
                }
                inner.publish(StreamEvent::job_completed(
                    job.id,
                    execution.id,
                    outcome.items_crawled,
                    outcome.items_indexed,
                ));
                info!(
                    job_id = %job.id, execution_id = %execution.id,
                    items_crawled = outcome.items_crawled,
                    "job execution completed"
                );
            }
            RunResult::Failed(message) => {
                let failure_count = current.failure_count + 1;
                let (interval_minutes, interval_type) =
                    Self::backoff_schedule(&inner, current, failure_count).await;
                // One more run is allowed at failure_count == max_retries;
                // past that the job parks until an operator retries.
                let next_run_at = if failure_count <= current.max_retries {
                    Some(finished_at + ChronoDuration::minutes(interval_minutes))
                } else {
                    None
                };
                if let Err(e) = inner
                    .database
                    .finish_execution(execution.id, ExecutionStatus::Failed, 0, 0, Some(&message))
                    .await
                {
                    error!(execution_id = %execution.id, "failed to seal execution: {e}");
                }
                match inner
                    .database
                    .finish_job_failure(
                        job.id,
                        finished_at,
                        &message,
                        failure_count,
                        Some(interval_minutes),
                        interval_type,
                        next_run_at,
                    )
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(job_id = %job.id, "job deleted during run, not resurrecting"),
                    Err(e) => error!(job_id = %job.id, "failed to record failure: {e}"),
                }
                inner.publish(StreamEvent::job_failed(job.id, execution.id, &message));
                warn!(
                    job_id = %job.id, execution_id = %execution.id, failure_count,
                    "job execution failed: {message}"
                );
            }
            RunResult::Cancelled => {
                if let Err(e) = inner
                    .database
                    .finish_execution(execution.id, ExecutionStatus::Cancelled, 0, 0, None)
                    .await
                {
                    error!(execution_id = %execution.id, "failed to seal execution: {e}");
                }
                if let Err(e) = inner.database.finish_job_cancelled(job.id, finished_at).await {
                    error!(job_id = %job.id, "failed to record cancellation: {e}");
                }
                inner.publish(StreamEvent::job_cancelled(job.id, execution.id));
                info!(job_id = %job.id, execution_id = %execution.id, "job execution cancelled");
            }
        }

        inner.active_jobs.write().await.remove(&job.id);
        if let Some(logs) = &inner.logs {
            logs.finish_execution(execution.id).await;
        }
        drop(permit);
    }

    async fn run_crawl(
        factory: &dyn CrawlerFactory,
        token: CancellationToken,
        source_id: String,
    ) -> Result<CrawlOutcome> {
        let mut crawler = factory.create();
        crawler.start(token, &source_id).await?;
        crawler.wait().await
    }

    /// Backoff interval for the next attempt. Prefers a full recompute
    /// from current source metadata; falls back to doubling the stored
    /// interval when the catalog cannot answer.
    async fn backoff_schedule(
        inner: &SchedulerInner,
        job: &Job,
        failure_count: i32,
    ) -> (i64, IntervalType) {
        match inner.sources.get_source(job.source_id).await {
            Ok(source) => {
                let params = compute_schedule(
                    source.rate_limit,
                    source.max_depth,
                    source.priority,
                    failure_count,
                );
                (params.interval_minutes, params.interval_type)
            }
            Err(e) => {
                debug!(
                    source_id = %job.source_id,
                    "schedule recompute unavailable, doubling stored interval: {e}"
                );
                let doubled = job
                    .interval_minutes
                    .unwrap_or(60)
                    .saturating_mul(2)
                    .min(MAX_INTERVAL_MINUTES);
                let interval_type = if doubled % 60 == 0 {
                    IntervalType::Hours
                } else {
                    IntervalType::Minutes
                };
                (doubled, interval_type)
            }
        }
    }

    // Manual operations, exposed through the HTTP surface.

    pub async fn pause(&self, job_id: Uuid) -> Result<()> {
        if !self.inner.database.pause_job(job_id).await? {
            return Err(AppError::not_found("job", job_id.to_string()));
        }
        info!(job_id = %job_id, "job paused");
        Ok(())
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<()> {
        if !self.inner.database.resume_job(job_id, Utc::now()).await? {
            return Err(AppError::not_found("job", job_id.to_string()));
        }
        self.inner.tick_nudge.notify_one();
        info!(job_id = %job_id, "job resumed");
        Ok(())
    }

    /// Cancel a running execution, or mark a idle job cancelled.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let active = self.inner.active_jobs.read().await.get(&job_id).cloned();
        if let Some(token) = active {
            token.cancel();
            info!(job_id = %job_id, "cancellation signalled to running execution");
            return Ok(());
        }
        if !self.inner.database.set_job_cancelled(job_id).await? {
            return Err(AppError::not_found("job", job_id.to_string()));
        }
        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    pub async fn force_run(&self, job_id: Uuid) -> Result<()> {
        if !self.inner.database.force_run_job(job_id, Utc::now()).await? {
            return Err(AppError::not_found("job", job_id.to_string()));
        }
        self.inner.tick_nudge.notify_one();
        info!(job_id = %job_id, "job nudged for immediate run");
        Ok(())
    }

    pub async fn retry(&self, job_id: Uuid) -> Result<()> {
        if !self.inner.database.retry_job(job_id, Utc::now()).await? {
            return Err(AppError::not_found("job", job_id.to_string()));
        }
        self.inner.tick_nudge.notify_one();
        info!(job_id = %job_id, "job failure count reset");
        Ok(())
    }

    /// Number of executions currently in flight.
    pub async fn active_count(&self) -> usize {
        self.inner.active_jobs.read().await.len()
    }
}
