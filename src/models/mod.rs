use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority tier reported by the source catalog.
///
/// Unknown or blank values fall back to `Normal`, matching how the
/// source service has historically populated this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl SourcePriority {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => SourcePriority::Low,
            "high" => SourcePriority::High,
            "critical" => SourcePriority::Critical,
            _ => SourcePriority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePriority::Low => "low",
            SourcePriority::Normal => "normal",
            SourcePriority::High => "high",
            SourcePriority::Critical => "critical",
        }
    }
}

/// A content source as exposed by the source catalog service.
///
/// Read-only here; the orchestrator never writes sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub rate_limit: i32,
    #[serde(default)]
    pub max_depth: i32,
    #[serde(default = "default_priority")]
    pub priority: SourcePriority,
    pub enabled: bool,
}

fn default_priority() -> SourcePriority {
    SourcePriority::Normal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// Rendering hint only. Scheduling math always uses `interval_minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    Minutes,
    Hours,
}

impl IntervalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Minutes => "minutes",
            IntervalType::Hours => "hours",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "hours" => IntervalType::Hours,
            _ => IntervalType::Minutes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    None,
    Migrated,
    Orphaned,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::None => "none",
            MigrationStatus::Migrated => "migrated",
            MigrationStatus::Orphaned => "orphaned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "migrated" => MigrationStatus::Migrated,
            "orphaned" => MigrationStatus::Orphaned,
            _ => MigrationStatus::None,
        }
    }
}

/// The scheduling unit. One row per crawl job.
///
/// Auto-managed jobs are owned by the event pipeline and carry a
/// non-nil `source_id` and a derived interval; manual jobs are legacy
/// rows awaiting migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub url: String,
    pub auto_managed: bool,
    pub interval_minutes: Option<i64>,
    pub interval_type: IntervalType,
    pub priority: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub schedule_enabled: bool,
    pub is_paused: bool,
    pub failure_count: i32,
    pub max_retries: i32,
    pub retry_backoff_seconds: i32,
    pub scheduler_version: i64,
    pub migration_status: MigrationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// One attempted run of a job. Sealed once terminal, never mutated after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub items_crawled: i64,
    pub items_indexed: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceEventType {
    #[serde(rename = "source.created")]
    SourceCreated,
    #[serde(rename = "source.updated")]
    SourceUpdated,
    #[serde(rename = "source.deleted")]
    SourceDeleted,
    #[serde(rename = "source.enabled")]
    SourceEnabled,
    #[serde(rename = "source.disabled")]
    SourceDisabled,
}

impl SourceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceEventType::SourceCreated => "source.created",
            SourceEventType::SourceUpdated => "source.updated",
            SourceEventType::SourceDeleted => "source.deleted",
            SourceEventType::SourceEnabled => "source.enabled",
            SourceEventType::SourceDisabled => "source.disabled",
        }
    }
}

/// Payload carried on a source lifecycle event.
///
/// Only `SourceCreated` is required to carry the full source snapshot;
/// the other event types populate the fields they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceEventPayload {
    pub name: Option<String>,
    pub url: Option<String>,
    pub rate_limit: Option<i32>,
    pub max_depth: Option<i32>,
    pub priority: Option<String>,
    pub enabled: Option<bool>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

/// A lifecycle event emitted by the source catalog.
///
/// Delivery is at-least-once; `event_id` keys the idempotency ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEvent {
    pub event_id: Uuid,
    pub event_type: SourceEventType,
    pub source_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: SourceEventPayload,
}

// HTTP request/response types

#[derive(Debug, Clone, Deserialize)]
pub struct JobCreateRequest {
    pub source_id: Uuid,
    pub source_name: Option<String>,
    pub url: Option<String>,
    pub interval_minutes: Option<i64>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub schedule_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobUpdateRequest {
    pub source_name: Option<String>,
    pub url: Option<String>,
    pub interval_minutes: Option<i64>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub schedule_enabled: Option<bool>,
}

/// Filter accepted by the job list endpoint and repository.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub auto_managed: Option<bool>,
    pub source_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregate result of one migration batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationResult {
    pub processed: usize,
    pub migrated: usize,
    pub orphaned: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStats {
    pub none: i64,
    pub migrated: i64,
    pub orphaned: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parse_falls_back_to_normal() {
        assert_eq!(SourcePriority::parse("critical"), SourcePriority::Critical);
        assert_eq!(SourcePriority::parse("HIGH"), SourcePriority::High);
        assert_eq!(SourcePriority::parse(""), SourcePriority::Normal);
        assert_eq!(SourcePriority::parse("urgent"), SourcePriority::Normal);
    }

    #[test]
    fn job_status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn execution_status_terminal() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn source_event_deserializes_wire_shape() {
        let raw = r#"{
            "event_id": "7c5e3f7a-9f7a-4c2e-8d8a-2b1f6c9d0e11",
            "event_type": "source.created",
            "source_id": "1f0e2d3c-4b5a-6978-8796-a5b4c3d2e1f0",
            "timestamp": "2024-05-01T12:00:00Z",
            "payload": {
                "name": "Acme",
                "url": "https://acme.example/feed",
                "rate_limit": 10,
                "max_depth": 2,
                "priority": "normal",
                "enabled": true
            }
        }"#;
        let event: SourceEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, SourceEventType::SourceCreated);
        assert_eq!(event.payload.name.as_deref(), Some("Acme"));
        assert!(event.payload.changed_fields.is_empty());
    }
}
