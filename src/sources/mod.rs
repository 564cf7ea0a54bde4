//! Source catalog client.
//!
//! The catalog is an external service; the orchestrator only ever reads
//! from it, and only by source id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SourceClientConfig;
use crate::errors::SourceClientError;
use crate::models::Source;

#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn get_source(&self, id: Uuid) -> Result<Source, SourceClientError>;
}

/// HTTP client against the source catalog service.
pub struct HttpSourceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSourceClient {
    pub fn new(config: &SourceClientConfig) -> Result<Self, SourceClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SourceClientError::Unavailable {
                message: format!("building http client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn get_source(&self, id: Uuid) -> Result<Source, SourceClientError> {
        let url = format!("{}/api/v1/sources/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceClientError::Unavailable {
                message: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceClientError::NotFound(id));
        }
        if !response.status().is_success() {
            return Err(SourceClientError::Unavailable {
                message: format!("source catalog returned {}", response.status()),
            });
        }

        response
            .json::<Source>()
            .await
            .map_err(|e| SourceClientError::Malformed {
                message: e.to_string(),
            })
    }
}

/// In-memory catalog used by tests and local development wiring.
#[derive(Clone, Default)]
pub struct MemorySourceClient {
    sources: Arc<RwLock<HashMap<Uuid, Source>>>,
}

impl MemorySourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, source: Source) {
        self.sources.write().await.insert(source.id, source);
    }

    pub async fn remove(&self, id: Uuid) {
        self.sources.write().await.remove(&id);
    }
}

#[async_trait]
impl SourceClient for MemorySourceClient {
    async fn get_source(&self, id: Uuid) -> Result<Source, SourceClientError> {
        self.sources
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SourceClientError::NotFound(id))
    }
}
