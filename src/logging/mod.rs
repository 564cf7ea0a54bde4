//! Per-execution log capture.
//!
//! Every execution gets a bounded in-memory ring buffer. Two optional
//! sinks hang off it: a live stream writer with a TTL, and an archiver
//! invoked once on finalize. Neither sink may fail the execution.

pub mod capture;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::config::LogsConfig;
use crate::sse::{SseBroker, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One captured log record for an execution.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub fields: HashMap<String, String>,
}

/// Live sink for log records, e.g. a stream store with expiry.
pub trait LogStreamWriter: Send + Sync {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<()>;
}

/// Terminal sink: uploads the full buffer once an execution finishes.
#[async_trait::async_trait]
pub trait LogArchiver: Send + Sync {
    async fn archive(&self, key: &str, entries: &[LogEntry]) -> anyhow::Result<()>;
}

struct ExecutionBuffer {
    job_id: Uuid,
    started_at: DateTime<Utc>,
    entries: VecDeque<LogEntry>,
    finished_at: Option<DateTime<Utc>>,
}

struct Inner {
    buffers: RwLock<HashMap<Uuid, ExecutionBuffer>>,
    buffer_size: usize,
    min_level: LogLevel,
    stream_writer: Option<Arc<dyn LogStreamWriter>>,
    broker: Option<SseBroker>,
}

/// Owns the per-execution buffers and fans records out to the sinks.
#[derive(Clone)]
pub struct LogService {
    inner: Arc<Inner>,
    archiver: Option<Arc<dyn LogArchiver>>,
    archive_bucket: String,
    archive_enabled: bool,
}

impl LogService {
    pub fn new(
        config: &LogsConfig,
        broker: Option<SseBroker>,
        stream_writer: Option<Arc<dyn LogStreamWriter>>,
        archiver: Option<Arc<dyn LogArchiver>>,
    ) -> Self {
        let min_level = LogLevel::parse(&config.min_level).unwrap_or(LogLevel::Info);
        Self {
            inner: Arc::new(Inner {
                buffers: RwLock::new(HashMap::new()),
                buffer_size: config.buffer_size.max(1),
                min_level,
                stream_writer: if config.stream_enabled {
                    stream_writer
                } else {
                    None
                },
                broker,
            }),
            archiver,
            archive_bucket: config.archive_bucket.clone(),
            archive_enabled: config.archive_enabled,
        }
    }

    /// Register an execution and hand back its sink.
    pub fn attach_execution(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> ExecutionLogSink {
        self.inner
            .buffers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                execution_id,
                ExecutionBuffer {
                    job_id,
                    started_at,
                    entries: VecDeque::new(),
                    finished_at: None,
                },
            );
        ExecutionLogSink {
            service: self.clone(),
            execution_id,
        }
    }

    /// Append a record to an execution's buffer and forward to sinks.
    /// Unknown execution ids are ignored; records below the configured
    /// level are filtered out.
    pub fn append(
        &self,
        execution_id: Uuid,
        level: LogLevel,
        message: &str,
        fields: HashMap<String, String>,
    ) {
        if level < self.inner.min_level {
            return;
        }

        let entry = LogEntry {
            execution_id,
            timestamp: Utc::now(),
            level: level.as_str().to_string(),
            message: message.to_string(),
            fields,
        };

        let job_id = {
            let mut buffers = self.inner.buffers.write().unwrap_or_else(|e| e.into_inner());
            let Some(buffer) = buffers.get_mut(&execution_id) else {
                return;
            };
            if buffer.finished_at.is_some() {
                return;
            }
            if buffer.entries.len() >= self.inner.buffer_size {
                buffer.entries.pop_front();
            }
            buffer.entries.push_back(entry.clone());
            buffer.job_id
        };

        if let Some(writer) = &self.inner.stream_writer {
            if let Err(e) = writer.append(&entry) {
                warn!(execution_id = %execution_id, "log stream write failed: {e}");
            }
        }

        if let Some(broker) = &self.inner.broker {
            broker.publish(StreamEvent::log_line(
                job_id,
                execution_id,
                &entry.level,
                &entry.message,
                &entry.fields,
            ));
        }
    }

    /// Finalize an execution: archive the buffer when configured and
    /// mark it finished. Archive failures are logged, never surfaced.
    pub async fn finish_execution(&self, execution_id: Uuid) {
        let archived = {
            let mut buffers = self.inner.buffers.write().unwrap_or_else(|e| e.into_inner());
            match buffers.get_mut(&execution_id) {
                Some(buffer) if buffer.finished_at.is_none() => {
                    buffer.finished_at = Some(Utc::now());
                    Some((
                        buffer.job_id,
                        buffer.started_at,
                        buffer.entries.iter().cloned().collect::<Vec<_>>(),
                    ))
                }
                _ => None,
            }
        };

        if !self.archive_enabled {
            return;
        }
        let (Some(archiver), Some((job_id, started_at, entries))) = (&self.archiver, archived)
        else {
            return;
        };

        let key = format!(
            "{}/{}/{}/{}",
            self.archive_bucket,
            job_id,
            execution_id,
            started_at.format("%Y%m%dT%H%M%SZ")
        );
        if let Err(e) = archiver.archive(&key, &entries).await {
            warn!(execution_id = %execution_id, key = %key, "log archive failed: {e}");
        }
    }

    /// Buffered records for one execution, oldest first.
    pub fn logs_for_execution(&self, execution_id: Uuid) -> Vec<LogEntry> {
        self.inner
            .buffers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&execution_id)
            .map(|b| b.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Buffered records across a job's retained executions, oldest
    /// execution first.
    pub fn logs_for_job(&self, job_id: Uuid) -> Vec<LogEntry> {
        let buffers = self.inner.buffers.read().unwrap_or_else(|e| e.into_inner());
        let mut owned: Vec<&ExecutionBuffer> =
            buffers.values().filter(|b| b.job_id == job_id).collect();
        owned.sort_by_key(|b| b.started_at);
        owned
            .into_iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect()
    }

    /// Drop finished buffers older than the cutoff. Live executions are
    /// always retained.
    pub fn cleanup_finished(&self, max_age: chrono::Duration) {
        let cutoff = Utc::now() - max_age;
        self.inner
            .buffers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, buffer| match buffer.finished_at {
                Some(finished_at) => finished_at > cutoff,
                None => true,
            });
    }
}

/// Handle a single execution logs through.
#[derive(Clone)]
pub struct ExecutionLogSink {
    service: LogService,
    execution_id: Uuid,
}

impl ExecutionLogSink {
    pub fn log(&self, level: LogLevel, message: &str) {
        self.service
            .append(self.execution_id, level, message, HashMap::new());
    }

    pub fn log_with_fields(&self, level: LogLevel, message: &str, fields: HashMap<String, String>) {
        self.service.append(self.execution_id, level, message, fields);
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

/// Stream writer retaining entries in memory, used by tests and as a
/// stand-in until a real stream store is wired.
#[derive(Default)]
pub struct MemoryStreamWriter {
    pub entries: std::sync::Mutex<Vec<LogEntry>>,
}

impl LogStreamWriter for MemoryStreamWriter {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }
}

/// Archiver writing one JSON blob per execution under a local
/// directory tree mirroring the bucket layout.
pub struct FsLogArchiver {
    root: std::path::PathBuf,
}

impl FsLogArchiver {
    pub fn new<P: Into<std::path::PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl LogArchiver for FsLogArchiver {
    async fn archive(&self, key: &str, entries: &[LogEntry]) -> anyhow::Result<()> {
        let path = self.root.join(format!("{key}.json"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let blob = serde_json::to_vec(entries)?;
        tokio::fs::write(&path, blob).await?;
        Ok(())
    }
}
