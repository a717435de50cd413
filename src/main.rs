use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use fuel_code::{
    config::ServerConfig, consumer::Consumer, ingest, objectstore::LocalObjectStore,
    processor::Processor, queue::StreamQueue, recovery, rest, storage::Storage,
    summarizer::{DisabledSummarizer, HttpSummarizer, Summarizer}, telemetry,
    transcript::TranscriptPipeline, ws::Hub, AppContext,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fuel-code", about = "Telemetry ingest and realtime fan-out server", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    let args = Args::parse();
    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server().await,
    }
}

async fn run_server() -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "fuel-code starting");

    let config = Arc::new(ServerConfig::from_env().context("loading configuration")?);
    info!(port = config.port, "config loaded");

    let storage = Arc::new(Storage::connect(&config.database_url).await?);
    let objects: Arc<dyn fuel_code::objectstore::ObjectStore> =
        Arc::new(LocalObjectStore::new(&config.object_store_root));
    let hub = Arc::new(Hub::new());
    hub.spawn_keepalive();

    let summarizer: Arc<dyn Summarizer> = if config.summary_enabled {
        Arc::new(HttpSummarizer::new(
            config.summary_endpoint.clone(),
            config.summary_model.clone(),
        ))
    } else {
        Arc::new(DisabledSummarizer)
    };

    let pipeline = TranscriptPipeline::new(
        Arc::clone(&storage),
        Arc::clone(&objects),
        Arc::clone(&hub),
        Arc::clone(&summarizer),
        config.pipeline_pool_size,
        config.pipeline_pending_max,
        config.summary_enabled,
    );
    pipeline.spawn_workers();

    let queue: Arc<dyn fuel_code::queue::Queue> = Arc::new(
        StreamQueue::connect(&config.queue_url, "fuel-code:events", "fuel-code-consumers").await?,
    );

    let ctx = AppContext {
        config: Arc::clone(&config),
        storage: Arc::clone(&storage),
        queue: Arc::clone(&queue),
        objects: Arc::clone(&objects),
        hub: Arc::clone(&hub),
        pipeline: Arc::clone(&pipeline),
        summarizer: Arc::clone(&summarizer),
    };

    let processor = Arc::new(Processor::new(
        Arc::clone(&storage),
        Arc::clone(&hub),
        Arc::clone(&pipeline),
    ));
    let consumer = Arc::new(Consumer::new(
        Arc::clone(&queue),
        processor,
        "fuel-code-consumer-1".to_string(),
        config.consumer_claim_idle_ms,
        config.consumer_block_ms,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let consumer = Arc::clone(&consumer);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { consumer.run(shutdown_rx).await });
    }

    tokio::spawn(recovery::run_once(Arc::clone(&storage), Arc::clone(&pipeline)));

    let app = axum::Router::new()
        .merge(ingest::router())
        .merge(rest::router())
        .merge(fuel_code::ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "fuel-code listening");

    let shutdown_signal = make_shutdown_future();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    warn!("fuel-code shut down");
    Ok(())
}

async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
