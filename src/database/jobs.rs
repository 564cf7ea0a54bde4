use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{parse_datetime, parse_optional_datetime, Database};
use crate::errors::Result;
use crate::models::*;

const JOB_COLUMNS: &str = "id, source_id, source_name, url, auto_managed, interval_minutes, \
     interval_type, priority, next_run_at, status, schedule_enabled, is_paused, \
     failure_count, max_retries, retry_backoff_seconds, scheduler_version, \
     migration_status, started_at, completed_at, error_message, created_at, updated_at";

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status_str: String = row.get("status");
    let status = JobStatus::parse(&status_str).ok_or_else(|| {
        crate::errors::AppError::fatal(format!("unknown job status in database: {status_str}"))
    })?;

    Ok(Job {
        id: Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| crate::errors::AppError::fatal(format!("corrupt job id: {e}")))?,
        source_id: Uuid::parse_str(&row.get::<String, _>("source_id"))
            .map_err(|e| crate::errors::AppError::fatal(format!("corrupt source id: {e}")))?,
        source_name: row.get("source_name"),
        url: row.get("url"),
        auto_managed: row.get("auto_managed"),
        interval_minutes: row.get("interval_minutes"),
        interval_type: IntervalType::parse(&row.get::<String, _>("interval_type")),
        priority: row.get("priority"),
        next_run_at: parse_optional_datetime(row.get("next_run_at"))?,
        status,
        schedule_enabled: row.get("schedule_enabled"),
        is_paused: row.get("is_paused"),
        failure_count: row.get("failure_count"),
        max_retries: row.get("max_retries"),
        retry_backoff_seconds: row.get("retry_backoff_seconds"),
        scheduler_version: row.get("scheduler_version"),
        migration_status: MigrationStatus::parse(&row.get::<String, _>("migration_status")),
        started_at: parse_optional_datetime(row.get("started_at"))?,
        completed_at: parse_optional_datetime(row.get("completed_at"))?,
        error_message: row.get("error_message"),
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

/// Insert-or-update an auto-managed job keyed on `source_id`, on an
/// existing connection so callers can bundle it with the event ledger
/// write. Updates preserve `id` and `created_at` and bump
/// `scheduler_version` so in-flight scheduling decisions get dropped.
pub(crate) async fn upsert_auto_managed_tx(
    conn: &mut sqlx::SqliteConnection,
    job: &Job,
) -> Result<Job> {
    let now = Utc::now();
    let existing = sqlx::query(
        "SELECT id, created_at, scheduler_version FROM jobs \
         WHERE source_id = ? AND auto_managed = TRUE",
    )
    .bind(job.source_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        let id: String = row.get("id");
        let version: i64 = row.get("scheduler_version");
        sqlx::query(
            "UPDATE jobs SET source_name = ?, url = ?, interval_minutes = ?, \
             interval_type = ?, priority = ?, next_run_at = ?, status = ?, \
             schedule_enabled = ?, is_paused = ?, failure_count = ?, max_retries = ?, \
             retry_backoff_seconds = ?, scheduler_version = ?, migration_status = ?, \
             error_message = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&job.source_name)
        .bind(&job.url)
        .bind(job.interval_minutes)
        .bind(job.interval_type.as_str())
        .bind(job.priority)
        .bind(job.next_run_at.map(|d| d.to_rfc3339()))
        .bind(job.status.as_str())
        .bind(job.schedule_enabled)
        .bind(job.is_paused)
        .bind(job.failure_count)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .bind(version + 1)
        .bind(job.migration_status.as_str())
        .bind(&job.error_message)
        .bind(now.to_rfc3339())
        .bind(&id)
        .execute(&mut *conn)
        .await?;

        let mut updated = job.clone();
        updated.id = Uuid::parse_str(&id)
            .map_err(|e| crate::errors::AppError::fatal(format!("corrupt job id: {e}")))?;
        updated.created_at = parse_datetime(&row.get::<String, _>("created_at"))?;
        updated.scheduler_version = version + 1;
        updated.updated_at = now;
        Ok(updated)
    } else {
        sqlx::query(
            "INSERT INTO jobs (id, source_id, source_name, url, auto_managed, \
             interval_minutes, interval_type, priority, next_run_at, status, \
             schedule_enabled, is_paused, failure_count, max_retries, \
             retry_backoff_seconds, scheduler_version, migration_status, \
             started_at, completed_at, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, TRUE, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.source_id.to_string())
        .bind(&job.source_name)
        .bind(&job.url)
        .bind(job.interval_minutes)
        .bind(job.interval_type.as_str())
        .bind(job.priority)
        .bind(job.next_run_at.map(|d| d.to_rfc3339()))
        .bind(job.status.as_str())
        .bind(job.schedule_enabled)
        .bind(job.is_paused)
        .bind(job.failure_count)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .bind(job.scheduler_version)
        .bind(job.migration_status.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *conn)
        .await?;

        let mut created = job.clone();
        created.auto_managed = true;
        created.created_at = now;
        created.updated_at = now;
        Ok(created)
    }
}

impl Database {
    pub async fn create_job(&self, job: &Job) -> Result<Job> {
        let now = Utc::now();
        info!(job_id = %job.id, source_id = %job.source_id, "creating job");

        sqlx::query(
            "INSERT INTO jobs (id, source_id, source_name, url, auto_managed, \
             interval_minutes, interval_type, priority, next_run_at, status, \
             schedule_enabled, is_paused, failure_count, max_retries, \
             retry_backoff_seconds, scheduler_version, migration_status, \
             started_at, completed_at, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.source_id.to_string())
        .bind(&job.source_name)
        .bind(&job.url)
        .bind(job.auto_managed)
        .bind(job.interval_minutes)
        .bind(job.interval_type.as_str())
        .bind(job.priority)
        .bind(job.next_run_at.map(|d| d.to_rfc3339()))
        .bind(job.status.as_str())
        .bind(job.schedule_enabled)
        .bind(job.is_paused)
        .bind(job.failure_count)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .bind(job.scheduler_version)
        .bind(job.migration_status.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(self.pool())
        .await?;

        let mut created = job.clone();
        created.created_at = now;
        created.updated_at = now;
        Ok(created)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Find the auto-managed job owned by the event pipeline for a
    /// source. Manual jobs sharing the source id are not returned.
    pub async fn find_job_by_source_id(&self, source_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE source_id = ? AND auto_managed = TRUE"
        ))
        .bind(source_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn upsert_auto_managed_job(&self, job: &Job) -> Result<Job> {
        let mut tx = self.pool().begin().await?;
        let result = upsert_auto_managed_tx(&mut tx, job).await?;
        tx.commit().await?;
        Ok(result)
    }

    pub async fn delete_jobs_by_source_id(&self, source_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE source_id = ? AND auto_managed = TRUE")
            .bind(source_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_job_status_by_source_id(
        &self,
        source_id: Uuid,
        status: JobStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, is_paused = ?, \
             scheduler_version = scheduler_version + 1, updated_at = ? \
             WHERE source_id = ? AND auto_managed = TRUE",
        )
        .bind(status.as_str())
        .bind(status == JobStatus::Paused)
        .bind(Utc::now().to_rfc3339())
        .bind(source_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_jobs(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.auto_managed.is_some() {
            sql.push_str(" AND auto_managed = ?");
        }
        if filter.source_id.is_some() {
            sql.push_str(" AND source_id = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(auto_managed) = filter.auto_managed {
            query = query.bind(auto_managed);
        }
        if let Some(source_id) = filter.source_id {
            query = query.bind(source_id.to_string());
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> Result<i64> {
        let mut sql = "SELECT COUNT(*) FROM jobs WHERE 1 = 1".to_string();
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.auto_managed.is_some() {
            sql.push_str(" AND auto_managed = ?");
        }
        if filter.source_id.is_some() {
            sql.push_str(" AND source_id = ?");
        }

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(auto_managed) = filter.auto_managed {
            query = query.bind(auto_managed);
        }
        if let Some(source_id) = filter.source_id {
            query = query.bind(source_id.to_string());
        }
        Ok(query.fetch_one(self.pool()).await?)
    }

    /// Full-row update by id. Bumps `scheduler_version` so any
    /// in-flight scheduling decision for this job is invalidated.
    pub async fn update_job(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET source_name = ?, url = ?, auto_managed = ?, \
             interval_minutes = ?, interval_type = ?, priority = ?, next_run_at = ?, \
             status = ?, schedule_enabled = ?, is_paused = ?, failure_count = ?, \
             max_retries = ?, retry_backoff_seconds = ?, \
             scheduler_version = scheduler_version + 1, migration_status = ?, \
             error_message = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&job.source_name)
        .bind(&job.url)
        .bind(job.auto_managed)
        .bind(job.interval_minutes)
        .bind(job.interval_type.as_str())
        .bind(job.priority)
        .bind(job.next_run_at.map(|d| d.to_rfc3339()))
        .bind(job.status.as_str())
        .bind(job.schedule_enabled)
        .bind(job.is_paused)
        .bind(job.failure_count)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .bind(job.migration_status.as_str())
        .bind(&job.error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(job.id.to_string())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Scheduler queries

    /// Jobs eligible to launch at `now`, highest priority first, oldest
    /// deadline first. A stale `next_run_at` in the past means due now.
    pub async fn find_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE schedule_enabled = TRUE AND is_paused = FALSE \
             AND status IN ('pending', 'scheduled', 'completed', 'failed') \
             AND (next_run_at IS NULL OR datetime(next_run_at) <= datetime(?)) \
             ORDER BY priority DESC, next_run_at ASC \
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// One-shot manual runs: gate disabled, still pending.
    pub async fn find_one_shot_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE schedule_enabled = FALSE AND status = 'pending' AND is_paused = FALSE \
             ORDER BY priority DESC, created_at ASC \
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn find_running_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running'"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Compare-and-set transition to `running`. Fails (returns false)
    /// when the job's `scheduler_version` moved since selection, when
    /// it was paused concurrently, or when it is already running.
    pub async fn mark_job_running(
        &self,
        job_id: Uuid,
        expected_version: i64,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?, updated_at = ? \
             WHERE id = ? AND scheduler_version = ? AND is_paused = FALSE \
             AND status != 'running'",
        )
        .bind(started_at.to_rfc3339())
        .bind(started_at.to_rfc3339())
        .bind(job_id.to_string())
        .bind(expected_version)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Successful run write-back. Write-if-exists: a job deleted while
    /// its execution ran stays deleted.
    pub async fn finish_job_success(
        &self,
        job_id: Uuid,
        completed_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?, failure_count = 0, \
             error_message = NULL, next_run_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(completed_at.to_rfc3339())
        .bind(next_run_at.map(|d| d.to_rfc3339()))
        .bind(completed_at.to_rfc3339())
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Failed run write-back with the recomputed backoff schedule.
    /// `next_run_at = None` parks the job until an operator retries.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_job_failure(
        &self,
        job_id: Uuid,
        completed_at: DateTime<Utc>,
        error_message: &str,
        failure_count: i32,
        interval_minutes: Option<i64>,
        interval_type: IntervalType,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = ?, failure_count = ?, \
             error_message = ?, interval_minutes = ?, interval_type = ?, \
             next_run_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(completed_at.to_rfc3339())
        .bind(failure_count)
        .bind(error_message)
        .bind(interval_minutes)
        .bind(interval_type.as_str())
        .bind(next_run_at.map(|d| d.to_rfc3339()))
        .bind(completed_at.to_rfc3339())
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_job_cancelled(
        &self,
        job_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(completed_at.to_rfc3339())
        .bind(completed_at.to_rfc3339())
        .bind(job_id.to_string())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reconcile a `running` row whose execution was abandoned (crash
    /// or shutdown deadline). Seals any open execution as failed too.
    pub async fn mark_job_stale(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE jobs SET status = 'failed', error_message = 'stale: execution abandoned', \
             completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE executions SET status = 'failed', finished_at = ?, \
             error_message = 'stale: execution abandoned' \
             WHERE job_id = ? AND status = 'running'",
        )
        .bind(now.to_rfc3339())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(job_id = %job_id, "reconciled stale running job");
        Ok(())
    }

    // Manual scheduler operations

    pub async fn pause_job(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET is_paused = TRUE, status = 'paused', \
             scheduler_version = scheduler_version + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn resume_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET is_paused = FALSE, status = 'pending', next_run_at = ?, \
             scheduler_version = scheduler_version + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn retry_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET failure_count = 0, status = 'pending', next_run_at = ?, \
             scheduler_version = scheduler_version + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Nudge the next tick. Leaves status and pause state untouched, so
    /// a paused job stays paused and merely carries a fresh deadline.
    pub async fn force_run_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_job_cancelled(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', \
             scheduler_version = scheduler_version + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // Migration helpers

    pub async fn find_manual_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE auto_managed = FALSE AND migration_status = 'none' \
             ORDER BY created_at ASC \
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn update_migration_status(
        &self,
        job_id: Uuid,
        status: MigrationStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET migration_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(job_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_by_migration_status(&self) -> Result<MigrationStats> {
        let rows = sqlx::query(
            "SELECT migration_status, COUNT(*) AS count FROM jobs GROUP BY migration_status",
        )
        .fetch_all(self.pool())
        .await?;

        let mut stats = MigrationStats::default();
        for row in rows {
            let status: String = row.get("migration_status");
            let count: i64 = row.get("count");
            match MigrationStatus::parse(&status) {
                MigrationStatus::None => stats.none = count,
                MigrationStatus::Migrated => stats.migrated = count,
                MigrationStatus::Orphaned => stats.orphaned = count,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_job(source_id: Uuid) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            source_id,
            source_name: "Acme".to_string(),
            url: "https://acme.example/feed".to_string(),
            auto_managed: true,
            interval_minutes: Some(60),
            interval_type: IntervalType::Hours,
            priority: 50,
            next_run_at: Some(now),
            status: JobStatus::Pending,
            schedule_enabled: true,
            is_paused: false,
            failure_count: 0,
            max_retries: 3,
            retry_backoff_seconds: 60,
            scheduler_version: 1,
            migration_status: MigrationStatus::None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_preserves_id_and_bumps_version() {
        let db = Database::new_in_memory().await.unwrap();
        let source_id = Uuid::new_v4();

        let first = db.upsert_auto_managed_job(&sample_job(source_id)).await.unwrap();

        let mut second = sample_job(source_id);
        second.interval_minutes = Some(90);
        let upserted = db.upsert_auto_managed_job(&second).await.unwrap();

        assert_eq!(upserted.id, first.id, "id must survive updates");
        assert_eq!(upserted.interval_minutes, Some(90));
        assert!(upserted.scheduler_version > first.scheduler_version);

        let count = db.count_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(count, 1, "one auto-managed row per source");
    }

    #[tokio::test]
    async fn due_jobs_ordered_by_priority_then_deadline() {
        let db = Database::new_in_memory().await.unwrap();
        let now = Utc::now();

        let mut low = sample_job(Uuid::new_v4());
        low.priority = 25;
        low.next_run_at = Some(now - Duration::minutes(10));
        db.create_job(&low).await.unwrap();

        let mut high_late = sample_job(Uuid::new_v4());
        high_late.priority = 75;
        high_late.next_run_at = Some(now - Duration::minutes(1));
        db.create_job(&high_late).await.unwrap();

        let mut high_early = sample_job(Uuid::new_v4());
        high_early.priority = 75;
        high_early.next_run_at = Some(now - Duration::minutes(5));
        db.create_job(&high_early).await.unwrap();

        let mut future = sample_job(Uuid::new_v4());
        future.next_run_at = Some(now + Duration::minutes(30));
        db.create_job(&future).await.unwrap();

        let due = db.find_due_jobs(now, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);
    }

    #[tokio::test]
    async fn due_query_skips_paused_and_running() {
        let db = Database::new_in_memory().await.unwrap();
        let now = Utc::now();

        let mut paused = sample_job(Uuid::new_v4());
        paused.is_paused = true;
        paused.status = JobStatus::Paused;
        paused.next_run_at = Some(now - Duration::minutes(1));
        db.create_job(&paused).await.unwrap();

        let mut running = sample_job(Uuid::new_v4());
        running.status = JobStatus::Running;
        running.next_run_at = Some(now - Duration::minutes(1));
        db.create_job(&running).await.unwrap();

        let mut null_deadline = sample_job(Uuid::new_v4());
        null_deadline.next_run_at = None;
        db.create_job(&null_deadline).await.unwrap();

        let due = db.find_due_jobs(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, null_deadline.id);
    }

    #[tokio::test]
    async fn mark_running_rejects_version_mismatch() {
        let db = Database::new_in_memory().await.unwrap();
        let job = db.upsert_auto_managed_job(&sample_job(Uuid::new_v4())).await.unwrap();

        // Concurrent pause bumps the version; the launch must drop.
        assert!(db.pause_job(job.id).await.unwrap());
        let launched = db
            .mark_job_running(job.id, job.scheduler_version, Utc::now())
            .await
            .unwrap();
        assert!(!launched);

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
    }

    #[tokio::test]
    async fn success_write_back_does_not_resurrect_deleted_job() {
        let db = Database::new_in_memory().await.unwrap();
        let job = db.upsert_auto_managed_job(&sample_job(Uuid::new_v4())).await.unwrap();

        db.delete_jobs_by_source_id(job.source_id).await.unwrap();
        let written = db
            .finish_job_success(job.id, Utc::now(), Some(Utc::now()))
            .await
            .unwrap();
        assert!(!written);
        assert!(db.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_run_on_paused_job_keeps_it_paused() {
        let db = Database::new_in_memory().await.unwrap();
        let job = db.upsert_auto_managed_job(&sample_job(Uuid::new_v4())).await.unwrap();
        db.pause_job(job.id).await.unwrap();

        let now = Utc::now();
        db.force_run_job(job.id, now).await.unwrap();

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.is_paused);
        assert_eq!(stored.status, JobStatus::Paused);
        assert_eq!(
            stored.next_run_at.map(|d| d.timestamp()),
            Some(now.timestamp())
        );

        let due = db.find_due_jobs(now + Duration::seconds(1), 10).await.unwrap();
        assert!(due.is_empty(), "paused jobs stay unselected");
    }

    #[tokio::test]
    async fn migration_counters_group_by_status() {
        let db = Database::new_in_memory().await.unwrap();

        let mut manual = sample_job(Uuid::new_v4());
        manual.auto_managed = false;
        let manual = db.create_job(&manual).await.unwrap();

        let mut orphan = sample_job(Uuid::new_v4());
        orphan.auto_managed = false;
        let orphan = db.create_job(&orphan).await.unwrap();

        db.update_migration_status(manual.id, MigrationStatus::Migrated)
            .await
            .unwrap();
        db.update_migration_status(orphan.id, MigrationStatus::Orphaned)
            .await
            .unwrap();

        let stats = db.count_by_migration_status().await.unwrap();
        assert_eq!(stats.migrated, 1);
        assert_eq!(stats.orphaned, 1);
        assert_eq!(stats.none, 0);

        let remaining = db.find_manual_jobs(10).await.unwrap();
        assert!(remaining.is_empty());
    }
}
