//! Spanline agent
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - SPANLINE_CONFIG: Path to a JSON config file (optional)
//! - SPANLINE_HOST: Bind address (default: 0.0.0.0)
//! - SPANLINE_PORT: Port number (default: 9529)
//! - SPANLINE_COLLECTOR_URL: Where accepted spans are sent
//! - SPANLINE_UDP_ADDRESS: UDP listen address (default: disabled)
//! - RUST_LOG: Log level (default: info)

use std::sync::Arc;
use tokio::sync::watch;

use spanline::api::{run_server, AppState};
use spanline::feed::HttpFeeder;
use spanline::ingest::{IngestPipeline, UdpListener};
use spanline::otel::OtlpJsonDecoder;
use spanline::{AgentConfig, Storage, WorkerPool};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spanline=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::load()?;

    tracing::info!("Spanline configuration:");
    tracing::info!("  Listen: {}:{}{}", config.host, config.port, config.endpoint);
    tracing::info!("  Collector: {}", config.collector_url);
    match &config.udp_address {
        Some(addr) => tracing::info!("  UDP: {}", addr),
        None => tracing::info!("  UDP: DISABLED"),
    }
    match &config.threads {
        Some(t) => tracing::info!(
            "  Worker pool: {} threads, {} buffer, {} ms admission timeout",
            t.threads,
            t.buffer,
            t.timeout_ms
        ),
        None => tracing::info!("  Worker pool: DISABLED (inline processing)"),
    }
    match &config.storage {
        Some(s) => tracing::info!(
            "  Storage: {} ({} MB, {:?})",
            s.path.display(),
            s.capacity_mb,
            s.policy
        ),
        None => tracing::info!("  Storage: DISABLED (failed feeds are dropped)"),
    }

    let feeder = Arc::new(HttpFeeder::new(config.collector_url.clone())?);
    let chain = config.build_chain(feeder)?;

    let mut builder = IngestPipeline::builder("otlp", Arc::new(OtlpJsonDecoder), chain);
    if let Some(threads) = &config.threads {
        let pool = Arc::new(WorkerPool::new(threads.into())?);
        pool.start()?;
        builder = builder.pool(pool);
    }
    if let Some(settings) = &config.storage {
        builder = builder.storage(Arc::new(Storage::open(settings.into())));
    }
    let pipeline = builder.build();

    if let Err(e) = pipeline.register_replay() {
        tracing::error!("Replay disabled: {}", e);
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    let udp_handle = match &config.udp_address {
        Some(addr) => {
            let listener = UdpListener::bind(addr, Arc::clone(&pipeline)).await?;
            Some(tokio::spawn(listener.run(stop_rx)))
        }
        None => None,
    };

    let state = Arc::new(AppState {
        pipeline: Arc::clone(&pipeline),
    });
    run_server(&config.server(), state, shutdown_signal(stop_tx)).await?;

    let grace = config.shutdown_grace();
    if let Some(handle) = udp_handle {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("UDP listener did not stop within {:?}", grace);
        }
    }
    pipeline.shutdown(grace).await;

    tracing::info!("Spanline stopped");
    Ok(())
}

/// Resolve on Ctrl-C and tell the other inputs to stop
async fn shutdown_signal(stop_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutdown signal received, stopping inputs...");
    stop_tx.send_replace(true);
}
