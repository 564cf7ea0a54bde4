//! HTTP interface.
//!
//! Thin handlers over the scheduler, repository, migrator and broker;
//! business logic stays in the service layer.

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, JobsConfig};
use crate::database::Database;
use crate::events::EventPublisher;
use crate::logging::LogService;
use crate::migration::Migrator;
use crate::scheduler::IntervalScheduler;
use crate::sse::SseBroker;

pub mod api;
pub mod responses;
pub mod sse;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub scheduler: IntervalScheduler,
    pub broker: SseBroker,
    pub logs: LogService,
    pub migrator: Arc<Migrator>,
    pub events: EventPublisher,
    pub defaults: JobsConfig,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &Config, state: AppState) -> Result<Self> {
        let app = Self::create_router(state);
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self { app, addr })
    }

    fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(api::health))
            .nest("/api/v1", Self::api_v1_routes())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    fn api_v1_routes() -> Router<AppState> {
        Router::new()
            // Jobs
            .route("/jobs", get(api::list_jobs).post(api::create_job))
            .route(
                "/jobs/:id",
                get(api::get_job).put(api::update_job).delete(api::delete_job),
            )
            // Scheduler operations
            .route("/jobs/:id/pause", post(api::pause_job))
            .route("/jobs/:id/resume", post(api::resume_job))
            .route("/jobs/:id/cancel", post(api::cancel_job))
            .route("/jobs/:id/retry", post(api::retry_job))
            .route("/jobs/:id/force-run", post(api::force_run_job))
            // Execution history and logs
            .route("/jobs/:id/executions", get(api::list_job_executions))
            .route("/jobs/:id/logs", get(api::get_job_logs))
            .route("/jobs/:id/logs/stream", get(sse::job_logs_stream))
            // Source event ingress and lifecycle event stream
            .route("/events", post(api::publish_event))
            .route("/events/stream", get(sse::events_stream))
            // Admin
            .route("/admin/migrate-jobs", post(api::migrate_jobs))
            .route("/admin/migration-stats", get(api::migration_stats))
    }

    /// Serve until the token fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
