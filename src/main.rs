//! MemoryX Server - Persistent Cognitive Memory for AI Agents
//!
//! Entry point: configuration, store wiring, the ingestion worker pool,
//! background schedulers (drift sweep, community job) and the HTTP server
//! with graceful shutdown.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use memoryx::{
    config::ServerConfig,
    handlers::{self, AppContext, AppState},
    metrics,
};

const STORE_FLUSH_TIMEOUT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("memoryx=info,tower_http=warn")),
        )
        .init();

    metrics::register_metrics().expect("Failed to register metrics");

    let config = ServerConfig::from_env();
    config.log();

    let state = AppContext::from_config(config.clone())?;

    // Ingestion workers: recover the durable queue, then dispatch
    let dispatcher = state.start_workers()?;
    info!(
        "Worker pool started ({} workers, {}s task deadline)",
        config.workers, config.task_deadline_secs
    );

    start_drift_sweep(Arc::clone(&state), config.sweep_interval_secs);
    start_community_job(Arc::clone(&state), config.community_interval_secs);

    // Rate limiting
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(config.rate_limit_per_second)
        .burst_size(config.rate_limit_burst)
        .finish()
        .expect("Failed to build rate limiter configuration");
    let governor_layer = GovernorLayer::new(governor_conf);
    info!(
        "Rate limiting: {} req/sec, burst of {}",
        config.rate_limit_per_second, config.rate_limit_burst
    );

    let cors = config.cors.to_layer();

    let app = handlers::build_router(Arc::clone(&state))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(memoryx::middleware::track_metrics))
                .layer(tower::limit::ConcurrencyLimitLayer::new(
                    config.max_concurrent_requests,
                ))
                .layer(cors),
        )
        .layer(governor_layer);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("MemoryX server ready on http://{}", addr);

    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    dispatcher.abort();
    run_shutdown_cleanup(state).await;

    Ok(())
}

// =============================================================================
// Background Schedulers
// =============================================================================

fn start_drift_sweep(state: AppState, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        // Skip the immediate first tick; ingest traffic comes first
        interval.tick().await;

        loop {
            interval.tick().await;
            match state.sweeper.sweep_all().await {
                Ok(report) if report.total() > 0 => {
                    info!("Drift sweep repaired {} entries", report.total());
                }
                Ok(_) => tracing::debug!("Drift sweep found no drift"),
                Err(e) => tracing::warn!("Drift sweep failed: {}", e),
            }
        }
    });

    info!("Drift sweep scheduler started (interval: {}s)", interval_secs);
}

fn start_community_job(state: AppState, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.tick().await;

        loop {
            interval.tick().await;
            match state.run_community_job().await {
                Ok(rebuilt) if rebuilt > 0 => {
                    info!("Community job rebuilt {} communities", rebuilt);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Community job failed: {}", e),
            }
        }
    });

    info!(
        "Community scheduler started (interval: {}h)",
        interval_secs / 3600
    );
}

// =============================================================================
// Shutdown Handling
// =============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_shutdown_cleanup(state: AppState) {
    info!("Flushing stores...");
    let flush = async { state.flush_stores() };
    match tokio::time::timeout(
        std::time::Duration::from_secs(STORE_FLUSH_TIMEOUT_SECS),
        flush,
    )
    .await
    {
        Ok(Ok(())) => info!("Stores flushed, shutdown complete"),
        Ok(Err(e)) => tracing::error!("Store flush failed: {}", e),
        Err(_) => tracing::error!("Store flush timed out after {}s", STORE_FLUSH_TIMEOUT_SECS),
    }
}
