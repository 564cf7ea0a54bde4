//! Crawler capability.
//!
//! The real page-fetching pipeline lives in its own service; the
//! scheduler only needs start/wait semantics and the per-run counters.
//! A minimal HTTP fetch implementation is provided for deployments
//! that have not wired a full crawler yet.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::sources::SourceClient;

/// Counters reported by a finished crawl.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlOutcome {
    pub items_crawled: i64,
    pub items_indexed: i64,
}

/// One crawl run. `start` must return quickly; `wait` blocks until the
/// run finishes or the token is cancelled.
///
/// The identifier passed to `start` is the source **id** (uuid string).
/// Pinned here once; implementations must not expect a source name.
#[async_trait]
pub trait Crawler: Send {
    async fn start(&mut self, token: CancellationToken, source_id: &str) -> Result<()>;
    async fn wait(&mut self) -> Result<CrawlOutcome>;
}

/// Produces one crawler per execution.
pub trait CrawlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Crawler>;
}

/// Fallback crawler: resolves the source and fetches its feed URL once.
pub struct HttpFetchCrawler {
    sources: Arc<dyn SourceClient>,
    handle: Option<JoinHandle<Result<CrawlOutcome>>>,
}

impl HttpFetchCrawler {
    pub fn new(sources: Arc<dyn SourceClient>) -> Self {
        Self {
            sources,
            handle: None,
        }
    }
}

#[async_trait]
impl Crawler for HttpFetchCrawler {
    async fn start(&mut self, token: CancellationToken, source_id: &str) -> Result<()> {
        let id = Uuid::parse_str(source_id)
            .map_err(|e| AppError::validation(format!("invalid source id '{source_id}': {e}")))?;
        let sources = self.sources.clone();

        self.handle = Some(tokio::spawn(async move {
            let source = sources.get_source(id).await?;
            let fetch = async {
                let response = reqwest::get(&source.url).await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(AppError::transient(format!(
                        "fetch of {} returned {status}",
                        source.url
                    )));
                }
                let body = response.bytes().await?;
                tracing::debug!(source_id = %id, bytes = body.len(), "fetched source feed");
                Ok(CrawlOutcome {
                    items_crawled: 1,
                    items_indexed: 1,
                })
            };

            tokio::select! {
                outcome = fetch => outcome,
                _ = token.cancelled() => Err(AppError::transient("crawl cancelled")),
            }
        }));

        Ok(())
    }

    async fn wait(&mut self) -> Result<CrawlOutcome> {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| AppError::fatal(format!("crawler task panicked: {e}")))?,
            None => Err(AppError::fatal("wait called before start")),
        }
    }
}

pub struct HttpFetchCrawlerFactory {
    sources: Arc<dyn SourceClient>,
}

impl HttpFetchCrawlerFactory {
    pub fn new(sources: Arc<dyn SourceClient>) -> Self {
        Self { sources }
    }
}

impl CrawlerFactory for HttpFetchCrawlerFactory {
    fn create(&self) -> Box<dyn Crawler> {
        Box::new(HttpFetchCrawler::new(self.sources.clone()))
    }
}
