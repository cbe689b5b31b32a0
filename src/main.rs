//! Regflow - Large-exposure ingestion, validation and reporting pipeline.

use anyhow::{Context, Result};
use clap::Parser;
use regflow_backend::{
    api::{router, ApiState},
    batch::{spawn_ingestion_listener, spawn_pipeline_workers, BatchPipeline, IngestionService},
    db::Database,
    events::{
        coordinator::ReportRetryHandler, FailureProcessor, FailureQueue, HandlerRegistry,
        MessageBus, Outbox, OutboxPublisher, ReportCoordinator,
    },
    models::{Config, StorageType},
    report::ReportGenerator,
    rules::RuleEngine,
    storage::{LocalFsBackend, MemoryBackend, ObjectStoreBackend, ObjectStoreGateway},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, sync::mpsc, sync::watch};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "regflow", about = "BCBS 239 exposure processing backend")]
struct Args {
    /// Override the database path from the environment.
    #[arg(long, env = "DATABASE_PATH")]
    database: Option<String>,
    /// Override the listen port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "regflow=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("load configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        warn!(error = %e, "prometheus exporter not installed");
    }

    let db = Database::new(&config.database_path)?;

    let backend: Arc<dyn ObjectStoreBackend> = match config.storage_type {
        StorageType::Local => Arc::new(LocalFsBackend::new(&config.storage_root)?),
        // The real object-store adapter is deployed as an external
        // collaborator; the in-memory backend keeps the contract alive for
        // ephemeral runs.
        StorageType::ObjectStore => Arc::new(MemoryBackend::new()),
    };
    let gateway = ObjectStoreGateway::new(
        backend,
        config.storage_bucket.clone(),
        config.storage_prefix.clone(),
        config.presign_secret.clone(),
    );

    let (bus, _bus_keepalive) = MessageBus::new(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Outbox publisher: committed events reach the bus at least once.
    let outbox = Outbox::new(db.clone());
    OutboxPublisher::new(db.clone(), bus.clone(), Duration::from_millis(200))
        .spawn(shutdown_rx.clone());

    // Pipeline worker pool fed by ingestion events.
    let engine = Arc::new(RuleEngine::new(config.rules_cache_across_batches));
    let pipeline = Arc::new(BatchPipeline::new(
        db.clone(),
        gateway.clone(),
        engine,
        &config,
    ));
    let (pipeline_tx, pipeline_rx) = mpsc::channel(256);
    spawn_pipeline_workers(pipeline, pipeline_rx, config.pipeline_workers);
    spawn_ingestion_listener(bus.subscribe(), pipeline_tx, shutdown_rx.clone());

    // Failure queue + report coordinator.
    let failure_queue = FailureQueue::new(
        db.clone(),
        outbox.clone(),
        config.retry_max_retries,
        config.retry_backoff_schedule.clone(),
    );
    let coordinator = Arc::new(ReportCoordinator::new(
        db.clone(),
        ReportGenerator::new(gateway.clone()),
        outbox,
        failure_queue.clone(),
        config.report_formats.clone(),
        config.coordinator_stale_event_hours,
    ));
    coordinator.clone().spawn(bus.subscribe(), shutdown_rx.clone());

    let mut registry = HandlerRegistry::new();
    registry.register(
        regflow_backend::events::coordinator::REPORT_GENERATION_EVENT_TYPE,
        Arc::new(ReportRetryHandler::new(coordinator)),
    );
    FailureProcessor::new(failure_queue, registry, config.failure_poll_interval)
        .spawn(shutdown_rx);

    // Thin HTTP boundary.
    let api_state = ApiState {
        ingestion: IngestionService::new(db, gateway),
    };
    let app = router(api_state).layer(CorsLayer::permissive());

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind port {}", config.port))?;
    info!(port = config.port, "regflow listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            shutdown_tx.send(true).ok();
        })
        .await
        .context("server error")?;

    Ok(())
}
