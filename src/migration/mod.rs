//! Conversion of legacy manual jobs into the auto-managed regime.
//!
//! Runs out-of-band, batched, triggered from the admin surface. Manual
//! jobs whose source no longer resolves are marked orphaned and left
//! out of scheduling.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::errors::{Result, SourceClientError};
use crate::models::*;
use crate::schedule::compute_schedule;
use crate::sources::SourceClient;

pub struct Migrator {
    database: Database,
    sources: Arc<dyn SourceClient>,
}

impl Migrator {
    pub fn new(database: Database, sources: Arc<dyn SourceClient>) -> Self {
        Self { database, sources }
    }

    /// Convert up to `batch_size` manual jobs. Safe to re-run; already
    /// visited jobs carry a non-none migration status and are skipped
    /// by the selection query.
    pub async fn migrate_batch(&self, batch_size: i64) -> Result<MigrationResult> {
        let mut result = MigrationResult::default();
        let jobs = self.database.find_manual_jobs(batch_size).await?;

        for job in jobs {
            result.processed += 1;
            match self.migrate_one(&job).await {
                Ok(outcome) => match outcome {
                    MigrationStatus::Migrated => result.migrated += 1,
                    MigrationStatus::Orphaned => result.orphaned += 1,
                    MigrationStatus::None => result.skipped += 1,
                },
                Err(e) => {
                    warn!(job_id = %job.id, "migration failed: {e}");
                    result.errors += 1;
                }
            }
        }

        info!(
            processed = result.processed,
            migrated = result.migrated,
            orphaned = result.orphaned,
            errors = result.errors,
            "migration batch finished"
        );
        Ok(result)
    }

    async fn migrate_one(&self, job: &Job) -> Result<MigrationStatus> {
        if job.source_id.is_nil() {
            warn!(job_id = %job.id, "manual job has no source, marking orphaned");
            self.database
                .update_migration_status(job.id, MigrationStatus::Orphaned)
                .await?;
            return Ok(MigrationStatus::Orphaned);
        }

        let source = match self.sources.get_source(job.source_id).await {
            Ok(source) => source,
            Err(SourceClientError::NotFound(_)) => {
                info!(job_id = %job.id, source_id = %job.source_id, "source gone, marking orphaned");
                self.database
                    .update_migration_status(job.id, MigrationStatus::Orphaned)
                    .await?;
                return Ok(MigrationStatus::Orphaned);
            }
            Err(e) => return Err(e.into()),
        };

        let params = compute_schedule(
            source.rate_limit,
            source.max_depth,
            source.priority,
            job.failure_count,
        );

        let mut migrated = job.clone();
        migrated.auto_managed = true;
        migrated.source_name = source.name;
        migrated.url = source.url;
        migrated.interval_minutes = Some(params.interval_minutes);
        migrated.interval_type = params.interval_type;
        migrated.priority = params.numeric_priority;
        migrated.schedule_enabled = true;
        migrated.migration_status = MigrationStatus::Migrated;
        if source.enabled {
            if migrated.next_run_at.is_none() {
                migrated.next_run_at = Some(chrono::Utc::now() + params.initial_delay);
            }
        } else {
            migrated.status = JobStatus::Paused;
            migrated.is_paused = true;
        }

        // The event pipeline may already own an auto-managed row for
        // this source; then the manual row only records the visit and
        // the owned row absorbs the recomputed schedule. Otherwise the
        // manual row converts in place, keeping its id.
        if self
            .database
            .find_job_by_source_id(job.source_id)
            .await?
            .is_some()
        {
            self.database.upsert_auto_managed_job(&migrated).await?;
            self.database
                .update_migration_status(job.id, MigrationStatus::Migrated)
                .await?;
        } else {
            self.database.update_job(&migrated).await?;
        }
        info!(
            job_id = %job.id, source_id = %job.source_id,
            interval_minutes = ?migrated.interval_minutes,
            "manual job migrated"
        );
        Ok(MigrationStatus::Migrated)
    }

    pub async fn stats(&self) -> Result<MigrationStats> {
        self.database.count_by_migration_status().await
    }
}
