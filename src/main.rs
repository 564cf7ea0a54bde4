use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawl_orchestrator::{
    config::Config,
    crawler::HttpFetchCrawlerFactory,
    database::Database,
    events::{ChannelEventStream, EventConsumer, EventService},
    logging::{capture::ExecutionCaptureLayer, FsLogArchiver, LogService},
    migration::Migrator,
    scheduler::IntervalScheduler,
    sources::HttpSourceClient,
    sse::SseBroker,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "crawl-orchestrator")]
#[command(about = "HTTP-fronted crawl orchestration service")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    // Broker and log capture exist before tracing init so the capture
    // layer can route execution-tagged events into job log streams.
    let broker = SseBroker::default();
    let archiver = if config.logs.archive_enabled {
        Some(Arc::new(FsLogArchiver::new("./data/log-archive"))
            as Arc<dyn crawl_orchestrator::logging::LogArchiver>)
    } else {
        None
    };
    let logs = LogService::new(&config.logs, Some(broker.clone()), None, archiver);

    let log_filter = format!("crawl_orchestrator={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(ExecutionCaptureLayer::new(logs.clone()))
        .init();

    info!("starting crawl orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!("configuration loaded from {}", cli.config);
    info!("using database {}", config.database.url);

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("database connection established and migrations applied");

    let sources = Arc::new(HttpSourceClient::new(&config.source_client)?);
    let crawler_factory = Arc::new(HttpFetchCrawlerFactory::new(sources.clone()));

    let scheduler = IntervalScheduler::new(
        database.clone(),
        crawler_factory,
        sources.clone(),
        Some(broker.clone()),
        Some(logs.clone()),
        config.scheduler.clone(),
    );
    scheduler.start();

    let shutdown = CancellationToken::new();

    let event_stream = Arc::new(ChannelEventStream::new(config.events.channel_capacity));
    let event_publisher = event_stream.publisher();
    let event_service = EventService::new(database.clone(), sources.clone(), config.jobs.clone());
    let consumer = EventConsumer::new(event_service, event_stream, config.events.group.clone());
    let consumer_handle = consumer.start(shutdown.clone());

    let migrator = Arc::new(Migrator::new(database.clone(), sources.clone()));

    let state = AppState {
        database,
        scheduler: scheduler.clone(),
        broker: broker.clone(),
        logs,
        migrator,
        events: event_publisher,
        defaults: config.jobs.clone(),
    };
    let server = WebServer::new(&config, state)?;
    info!("starting web server on {}:{}", server.host(), server.port());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    server.serve(shutdown.clone()).await?;

    shutdown.cancel();
    scheduler.stop().await;
    let _ = consumer_handle.await;
    broker.stop();
    info!("shutdown complete");

    Ok(())
}
