use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::errors::{AppError, Result};
use crate::models::*;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageParams {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Deserialize)]
pub struct JobListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
    pub auto_managed: Option<bool>,
    pub source_id: Option<Uuid>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": env!("CARGO_PKG_NAME") }))
}

// Job CRUD

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListParams>,
) -> Result<Json<JobListResponse>> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| AppError::validation(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let filter = JobFilter {
        status,
        auto_managed: params.auto_managed,
        source_id: params.source_id,
    };
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0).max(0);

    let jobs = state.database.list_jobs(&filter, limit, offset).await?;
    let total = state.database.count_jobs(&filter).await?;
    Ok(Json(JobListResponse {
        jobs,
        total,
        limit,
        offset,
    }))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    let job = state
        .database
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::not_found("job", id.to_string()))?;
    Ok(Json(job))
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<JobCreateRequest>,
) -> Result<(StatusCode, Json<Job>)> {
    if let Some(priority) = payload.priority {
        if !(25..=100).contains(&priority) {
            return Err(AppError::validation("priority must be between 25 and 100"));
        }
    }
    if let Some(url) = &payload.url {
        url::Url::parse(url).map_err(|e| AppError::validation(format!("invalid url: {e}")))?;
    }

    let now = Utc::now();
    let job = Job {
        id: Uuid::new_v4(),
        source_id: payload.source_id,
        source_name: payload.source_name.unwrap_or_default(),
        url: payload.url.unwrap_or_default(),
        auto_managed: false,
        interval_minutes: payload.interval_minutes,
        interval_type: IntervalType::Minutes,
        priority: payload.priority.unwrap_or(50),
        next_run_at: None,
        status: JobStatus::Pending,
        schedule_enabled: payload.schedule_enabled.unwrap_or(false),
        is_paused: false,
        failure_count: 0,
        max_retries: payload
            .max_retries
            .unwrap_or(state.defaults.default_max_retries),
        retry_backoff_seconds: state.defaults.default_retry_backoff_seconds,
        scheduler_version: 1,
        migration_status: MigrationStatus::None,
        started_at: None,
        completed_at: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };

    let created = state.database.create_job(&job).await?;
    info!(job_id = %created.id, "job created via api");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<JobUpdateRequest>,
) -> Result<Json<Job>> {
    let mut job = state
        .database
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::not_found("job", id.to_string()))?;

    if let Some(priority) = payload.priority {
        if !(25..=100).contains(&priority) {
            return Err(AppError::validation("priority must be between 25 and 100"));
        }
        job.priority = priority;
    }
    if let Some(source_name) = payload.source_name {
        job.source_name = source_name;
    }
    if let Some(url) = payload.url {
        url::Url::parse(&url).map_err(|e| AppError::validation(format!("invalid url: {e}")))?;
        job.url = url;
    }
    if let Some(interval_minutes) = payload.interval_minutes {
        job.interval_minutes = Some(interval_minutes);
    }
    if let Some(max_retries) = payload.max_retries {
        job.max_retries = max_retries;
    }
    if let Some(schedule_enabled) = payload.schedule_enabled {
        job.schedule_enabled = schedule_enabled;
    }

    if !state.database.update_job(&job).await? {
        return Err(AppError::not_found("job", id.to_string()));
    }
    let updated = state
        .database
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::not_found("job", id.to_string()))?;
    Ok(Json(updated))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    if !state.database.delete_job(id).await? {
        return Err(AppError::not_found("job", id.to_string()));
    }
    info!(job_id = %id, "job deleted via api");
    Ok(StatusCode::NO_CONTENT)
}

// Scheduler operations

pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    state.scheduler.pause(id).await?;
    job_after_op(&state, id).await
}

pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    state.scheduler.resume(id).await?;
    job_after_op(&state, id).await
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    state.scheduler.cancel(id).await?;
    job_after_op(&state, id).await
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    state.scheduler.retry(id).await?;
    job_after_op(&state, id).await
}

pub async fn force_run_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    state.scheduler.force_run(id).await?;
    job_after_op(&state, id).await
}

async fn job_after_op(state: &AppState, id: Uuid) -> Result<Json<Job>> {
    let job = state
        .database
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::not_found("job", id.to_string()))?;
    Ok(Json(job))
}

// Execution history and logs

pub async fn list_job_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageParams>,
) -> Result<Json<serde_json::Value>> {
    if state.database.get_job(id).await?.is_none() {
        return Err(AppError::not_found("job", id.to_string()));
    }
    let executions = state
        .database
        .list_executions(id, page.limit(), page.offset())
        .await?;
    let total = state.database.count_executions(id).await?;
    Ok(Json(json!({
        "executions": executions,
        "total": total,
        "limit": page.limit(),
        "offset": page.offset(),
    })))
}

pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageParams>,
) -> Result<Json<serde_json::Value>> {
    if state.database.get_job(id).await?.is_none() {
        return Err(AppError::not_found("job", id.to_string()));
    }
    let all = state.logs.logs_for_job(id);
    let total = all.len();
    let entries: Vec<_> = all
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect();
    Ok(Json(json!({
        "entries": entries,
        "total": total,
        "limit": page.limit(),
        "offset": page.offset(),
    })))
}

// Event ingress

/// Accept a source lifecycle event from the catalog's webhook and feed
/// it into the consumer's stream. Delivery downstream is at-least-once;
/// replays are harmless.
pub async fn publish_event(
    State(state): State<AppState>,
    Json(event): Json<SourceEvent>,
) -> Result<StatusCode> {
    state.events.publish(event).await?;
    Ok(StatusCode::ACCEPTED)
}

// Admin

#[derive(Debug, Deserialize)]
pub struct MigrateParams {
    pub batch_size: Option<i64>,
}

pub async fn migrate_jobs(
    State(state): State<AppState>,
    Query(params): Query<MigrateParams>,
) -> Result<Json<MigrationResult>> {
    let batch_size = params.batch_size.unwrap_or(50).clamp(1, 1000);
    let result = state.migrator.migrate_batch(batch_size).await?;
    Ok(Json(result))
}

pub async fn migration_stats(State(state): State<AppState>) -> Result<Json<MigrationStats>> {
    Ok(Json(state.migrator.stats().await?))
}
