mod cache;
mod config;
mod health;
mod http;
mod lfs;
mod links;
mod metrics;
mod storage;
mod tasks;
mod upstream;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::MemoryCache;
use crate::config::Config;
use crate::lfs::{BatchCoordinator, LfsContext};
use crate::metrics::MetricsRegistry;
use crate::storage::S3Storage;
use crate::tasks::BackgroundTasks;
use crate::upstream::HttpUpstream;

/// Region used for non-presigned object URLs when none is configured and the
/// AWS provider chain resolves none either.
const FALLBACK_REGION: &str = "us-east-1";

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "lfsproxy", about = "Git LFS caching reverse proxy backed by S3")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        env = "LFSPROXY_CONFIG",
        default_value = "/etc/lfsproxy/config.yaml"
    )]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub coordinator: Arc<BatchCoordinator>,
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_storage(config: &Config) -> Result<S3Storage> {
    let s3_config = &config.storage.s3;
    let mut aws_config_loader = aws_config::from_env();
    if let Some(region) = &s3_config.region {
        aws_config_loader = aws_config_loader.region(aws_config::Region::new(region.clone()));
    }
    let aws_config = aws_config_loader.load().await;

    let region = match aws_config.region() {
        Some(region) => region.to_string(),
        None => {
            tracing::warn!(
                region = FALLBACK_REGION,
                "no AWS region configured, assuming default"
            );
            FALLBACK_REGION.to_string()
        }
    };

    let client_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .accelerate(s3_config.use_accelerate)
        .build();
    let client = aws_sdk_s3::Client::from_conf(client_config);

    tracing::info!(
        bucket = %s3_config.bucket,
        %region,
        accelerate = s3_config.use_accelerate,
        presign = s3_config.presign_enabled,
        "S3 client initialised"
    );
    Ok(S3Storage::new(client, s3_config, region))
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .listen
        .parse()
        .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting lfsproxy");

    // ---- Infrastructure clients ----
    let store = build_s3_storage(&config).await?;

    let http_client =
        links::build_http_client(config.links.connect_timeout(), config.links.read_timeout())?;

    let upstream = HttpUpstream::new(
        http_client.clone(),
        &config.upstream.base_url,
        Duration::from_secs(config.upstream.timeout_secs),
    )?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Descriptor cache and background work ----
    let cache = Arc::new(MemoryCache::new(
        config.cache.eviction(),
        config.cache.max_entries,
    ));
    let tasks = BackgroundTasks::new(config.background.max_in_flight);

    let ctx = LfsContext {
        cache: cache.clone(),
        store: Arc::new(store),
        links: Arc::new(http_client),
        metrics: Arc::clone(&metrics.metrics),
        tasks: tasks.clone(),
    };
    let coordinator = BatchCoordinator::new(
        ctx,
        Arc::new(upstream),
        config.storage.s3.presign_enabled,
    );

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        metrics,
        coordinator: Arc::new(coordinator),
    };

    // ---- Serve until signalled ----
    if let Err(e) = run_http_server(state).await {
        tracing::error!(error = %e, "HTTP server failed");
    }

    tasks
        .shutdown(Duration::from_secs(config.background.drain_timeout_secs))
        .await;

    tracing::info!(
        cached_descriptors = cache.entry_count(),
        "lfsproxy shut down cleanly"
    );
    Ok(())
}
