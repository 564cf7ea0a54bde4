use chrono::Utc;
use uuid::Uuid;

use super::{jobs::upsert_auto_managed_tx, Database};
use crate::errors::{AppError, Result};
use crate::models::{Job, JobStatus};

fn map_ledger_error(event_id: Uuid, err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::duplicate("processed_event", event_id.to_string())
        }
        _ => AppError::Database(err),
    }
}

async fn record_event_tx(conn: &mut sqlx::SqliteConnection, event_id: Uuid) -> Result<()> {
    sqlx::query("INSERT INTO processed_events (event_id, processed_at) VALUES (?, ?)")
        .bind(event_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(conn)
        .await
        .map_err(|e| map_ledger_error(event_id, e))?;
    Ok(())
}

impl Database {
    /// Append to the idempotency ledger. Fails with `Duplicate` when the
    /// event was already recorded.
    pub async fn record_processed_event(&self, event_id: Uuid) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        record_event_tx(&mut conn, event_id).await
    }

    pub async fn is_event_processed(&self, event_id: Uuid) -> Result<bool> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM processed_events WHERE event_id = ?")
                .bind(event_id.to_string())
                .fetch_one(self.pool())
                .await?;
        Ok(count > 0)
    }

    /// Ledger write plus job upsert in one transaction, so a crash
    /// cannot leave the mutation applied but the event unrecorded.
    pub async fn record_event_and_upsert_job(&self, event_id: Uuid, job: &Job) -> Result<Job> {
        let mut tx = self.pool().begin().await?;
        record_event_tx(&mut tx, event_id).await?;
        let upserted = upsert_auto_managed_tx(&mut tx, job).await?;
        tx.commit().await?;
        Ok(upserted)
    }

    /// Ledger write plus auto-managed job deletion in one transaction.
    pub async fn record_event_and_delete_jobs(
        &self,
        event_id: Uuid,
        source_id: Uuid,
    ) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        record_event_tx(&mut tx, event_id).await?;
        let result = sqlx::query("DELETE FROM jobs WHERE source_id = ? AND auto_managed = TRUE")
            .bind(source_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Ledger write plus status transition in one transaction.
    pub async fn record_event_and_update_status(
        &self,
        event_id: Uuid,
        source_id: Uuid,
        status: JobStatus,
    ) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        record_event_tx(&mut tx, event_id).await?;
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, is_paused = ?, \
             scheduler_version = scheduler_version + 1, updated_at = ? \
             WHERE source_id = ? AND auto_managed = TRUE",
        )
        .bind(status.as_str())
        .bind(status == JobStatus::Paused)
        .bind(Utc::now().to_rfc3339())
        .bind(source_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ledger_rejects_replayed_event_ids() {
        let db = Database::new_in_memory().await.unwrap();
        let event_id = Uuid::new_v4();

        assert!(!db.is_event_processed(event_id).await.unwrap());
        db.record_processed_event(event_id).await.unwrap();
        assert!(db.is_event_processed(event_id).await.unwrap());

        let err = db.record_processed_event(event_id).await.unwrap_err();
        assert!(matches!(err, AppError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn combined_write_rolls_back_on_duplicate() {
        let db = Database::new_in_memory().await.unwrap();
        let event_id = Uuid::new_v4();
        let source_id = Uuid::new_v4();

        db.record_processed_event(event_id).await.unwrap();

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            source_id,
            source_name: "Acme".to_string(),
            url: "https://acme.example/feed".to_string(),
            auto_managed: true,
            interval_minutes: Some(60),
            interval_type: crate::models::IntervalType::Hours,
            priority: 50,
            next_run_at: Some(now),
            status: JobStatus::Pending,
            schedule_enabled: true,
            is_paused: false,
            failure_count: 0,
            max_retries: 3,
            retry_backoff_seconds: 60,
            scheduler_version: 1,
            migration_status: crate::models::MigrationStatus::None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        let err = db
            .record_event_and_upsert_job(event_id, &job)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Duplicate { .. }));

        // The job mutation must not have leaked out of the transaction.
        assert!(db.find_job_by_source_id(source_id).await.unwrap().is_none());
    }
}
