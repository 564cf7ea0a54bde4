use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, parse_optional_datetime, Database};
use crate::errors::Result;
use crate::models::{Execution, ExecutionStatus};

fn execution_from_row(row: &SqliteRow) -> Result<Execution> {
    Ok(Execution {
        id: Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| crate::errors::AppError::fatal(format!("corrupt execution id: {e}")))?,
        job_id: Uuid::parse_str(&row.get::<String, _>("job_id"))
            .map_err(|e| crate::errors::AppError::fatal(format!("corrupt job id: {e}")))?,
        started_at: parse_datetime(&row.get::<String, _>("started_at"))?,
        finished_at: parse_optional_datetime(row.get("finished_at"))?,
        status: ExecutionStatus::parse(&row.get::<String, _>("status")),
        items_crawled: row.get("items_crawled"),
        items_indexed: row.get("items_indexed"),
        error_message: row.get("error_message"),
    })
}

impl Database {
    pub async fn create_execution(
        &self,
        job_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Execution> {
        let execution = Execution {
            id: Uuid::new_v4(),
            job_id,
            started_at,
            finished_at: None,
            status: ExecutionStatus::Running,
            items_crawled: 0,
            items_indexed: 0,
            error_message: None,
        };

        sqlx::query(
            "INSERT INTO executions (id, job_id, started_at, finished_at, status, \
             items_crawled, items_indexed, error_message) \
             VALUES (?, ?, ?, NULL, 'running', 0, 0, NULL)",
        )
        .bind(execution.id.to_string())
        .bind(job_id.to_string())
        .bind(started_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(execution)
    }

    /// Seal an execution. Write-once: a row already in a terminal state
    /// is left untouched.
    pub async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        items_crawled: i64,
        items_indexed: i64,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = ?, finished_at = ?, items_crawled = ?, \
             items_indexed = ?, error_message = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(items_crawled)
        .bind(items_indexed)
        .bind(error_message)
        .bind(execution_id.to_string())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query(
            "SELECT id, job_id, started_at, finished_at, status, items_crawled, \
             items_indexed, error_message FROM executions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    pub async fn list_executions(
        &self,
        job_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            "SELECT id, job_id, started_at, finished_at, status, items_crawled, \
             items_indexed, error_message FROM executions \
             WHERE job_id = ? ORDER BY started_at DESC LIMIT ? OFFSET ?",
        )
        .bind(job_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    pub async fn count_executions(&self, job_id: Uuid) -> Result<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM executions WHERE job_id = ?")
                .bind(job_id.to_string())
                .fetch_one(self.pool())
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    async fn job_fixture(db: &Database) -> Job {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            source_name: "Fixture".to_string(),
            url: "https://fixture.example".to_string(),
            auto_managed: true,
            interval_minutes: Some(60),
            interval_type: IntervalType::Hours,
            priority: 50,
            next_run_at: None,
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
        };
        db.create_job(&job).await.unwrap()
    }

    #[tokio::test]
    async fn executions_seal_once() {
        let db = Database::new_in_memory().await.unwrap();
        let job = job_fixture(&db).await;

        let execution = db.create_execution(job.id, Utc::now()).await.unwrap();
        assert!(db
            .finish_execution(execution.id, ExecutionStatus::Completed, 42, 40, None)
            .await
            .unwrap());

        // A second seal attempt must not rewrite the terminal record.
        assert!(!db
            .finish_execution(
                execution.id,
                ExecutionStatus::Failed,
                0,
                0,
                Some("late failure")
            )
            .await
            .unwrap());

        let stored = db.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.items_crawled, 42);
        assert!(stored.finished_at.unwrap() >= stored.started_at);
    }

    #[tokio::test]
    async fn list_executions_pages_newest_first() {
        let db = Database::new_in_memory().await.unwrap();
        let job = job_fixture(&db).await;
        let base = Utc::now();

        for i in 0..3 {
            let execution = db
                .create_execution(job.id, base + chrono::Duration::seconds(i))
                .await
                .unwrap();
            db.finish_execution(execution.id, ExecutionStatus::Completed, i, i, None)
                .await
                .unwrap();
        }

        let page = db.list_executions(job.id, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].started_at >= page[1].started_at);
        assert_eq!(db.count_executions(job.id).await.unwrap(), 3);
    }
}
