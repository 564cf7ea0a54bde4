use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub source_client: SourceClientConfig,
    pub events: EventsConfig,
    pub scheduler: SchedulerConfig,
    pub jobs: JobsConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Consumer group name presented to the event stream.
    pub group: String,
    /// Capacity of the in-process event channel.
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_seconds: u64,
    pub reload_interval_seconds: u64,
    pub concurrency: usize,
    pub execution_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_seconds)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub default_max_retries: i32,
    pub default_retry_backoff_seconds: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    pub buffer_size: usize,
    pub min_level: String,
    pub stream_enabled: bool,
    pub stream_ttl_seconds: u64,
    pub archive_enabled: bool,
    pub archive_bucket: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./crawl-orchestrator.db".to_string(),
                max_connections: Some(10),
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            source_client: SourceClientConfig {
                base_url: "http://localhost:8081".to_string(),
                timeout_seconds: 10,
            },
            events: EventsConfig {
                group: "crawl-orchestrator".to_string(),
                channel_capacity: 1024,
            },
            scheduler: SchedulerConfig {
                tick_interval_seconds: 10,
                reload_interval_seconds: 300,
                concurrency: 4,
                execution_timeout_seconds: 1800,
                shutdown_timeout_seconds: 30,
            },
            jobs: JobsConfig {
                default_max_retries: 3,
                default_retry_backoff_seconds: 60,
            },
            logs: LogsConfig {
                buffer_size: 200,
                min_level: "info".to_string(),
                stream_enabled: false,
                stream_ttl_seconds: 3600,
                archive_enabled: false,
                archive_bucket: "crawl-logs".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from the given file, writing the defaults
    /// out when the file does not exist yet.
    pub fn load(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(path, contents)?;
            Ok(default_config)
        }
    }
}
