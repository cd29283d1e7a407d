//! Market Data Hub Binary
//!
//! Starts the WebSocket subscription server, the event router with its
//! ingest endpoint, and the health endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-hub
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//! - `MARKET_HUB_SOCKET_PORT`: WebSocket port (default: 8080)
//! - `MARKET_HUB_INGEST_PORT`: Event ingest HTTP port (default: 8081)
//! - `MARKET_HUB_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `MARKET_HUB_OUTBOUND_QUEUE_CAPACITY`: Frames queued per connection (default: 256)
//! - `MARKET_HUB_SEND_TIMEOUT_MS`: Per-write socket timeout (default: 5000)
//! - `MARKET_HUB_EVENT_QUEUE_CAPACITY`: Events queued per router partition (default: 4096)
//! - `MARKET_HUB_ROUTER_PARTITIONS`: Router worker count (default: 4)
//! - `MARKET_HUB_CANDLE_TICK_INTERVAL_MS`: Candle roll interval (default: 1000)
//! - `MARKET_HUB_LITE_BOOK_DEPTH`: Price levels per side in lite books (default: 20)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-data-hub)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_data_hub::infrastructure::telemetry;
use market_data_hub::{
    ConnectionTracker, EventRouter, HealthServer, HealthServerState, HubConfig,
    InMemoryMarketStore, IngestServer, MarketDataStore, SocketHub, SocketServer,
    SocketServerState, SubscriptionService, init_metrics,
};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Data Hub");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = HubConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Process-wide subscription state
    let hub = SocketHub::global();
    let store: Arc<dyn MarketDataStore> = Arc::new(InMemoryMarketStore::default());
    let connections = Arc::new(ConnectionTracker::new());

    // Start router workers; producers reach them through the ingest server
    let (router, router_handles) = EventRouter::spawn(
        Arc::clone(&hub),
        Arc::clone(&store),
        &config.router.router_config(),
        &shutdown_token,
    );
    let ingest_server = IngestServer::new(
        config.server.ingest_port,
        router.clone(),
        shutdown_token.clone(),
    );

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&hub),
        router,
        Arc::clone(&connections),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    // Initialize socket server
    let service = Arc::new(SubscriptionService::new(
        Arc::clone(&hub),
        store,
        config.router.lite_book_depth,
    ));
    let socket_state = Arc::new(SocketServerState::new(
        service,
        config.connection,
        connections,
        shutdown_token.clone(),
    ));
    let socket_server = SocketServer::new(config.server.socket_port, socket_state);

    // Spawn health server
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn ingest server; without it no events reach subscribers
    let ingest_shutdown = shutdown_token.clone();
    let ingest_task = tokio::spawn(async move {
        if let Err(e) = ingest_server.run().await {
            tracing::error!(error = %e, "Ingest server error");
            ingest_shutdown.cancel();
        }
    });

    // Spawn socket server; a failure here takes the whole hub down
    let socket_shutdown = shutdown_token.clone();
    let socket_task = tokio::spawn(async move {
        if let Err(e) = socket_server.run().await {
            tracing::error!(error = %e, "Socket server error");
            socket_shutdown.cancel();
        }
    });

    tracing::info!("Market data hub ready");

    await_shutdown(shutdown_token).await;

    let mut tasks = router_handles;
    tasks.push(health_task);
    tasks.push(ingest_task);
    tasks.push(socket_task);
    drain(tasks).await;

    if let Err(e) = hub.check_invariants() {
        tracing::error!(error = %e, "Registry inconsistent at shutdown");
    }

    tracing::info!("Market data hub stopped");
    Ok(())
}

/// Wait for background tasks, bounded by `SHUTDOWN_TIMEOUT`.
async fn drain(tasks: Vec<JoinHandle<()>>) {
    let all = futures::future::join_all(tasks);
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, all).await {
        Ok(results) => {
            for e in results.into_iter().filter_map(Result::err) {
                tracing::warn!(error = %e, "Task ended abnormally");
            }
        }
        Err(_) => {
            tracing::warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Shutdown timed out, abandoning tasks"
            );
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        socket_port = config.server.socket_port,
        ingest_port = config.server.ingest_port,
        health_port = config.server.health_port,
        partitions = config.router.partitions,
        "Configuration loaded"
    );
    tracing::debug!(
        outbound_queue_capacity = config.connection.outbound_queue_capacity,
        send_timeout_ms = config.connection.send_timeout.as_millis(),
        event_queue_capacity = config.router.event_queue_capacity,
        candle_tick_interval_ms = config.router.candle_tick_interval.as_millis(),
        lite_book_depth = config.router.lite_book_depth,
        "Delivery settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Shutdown requested internally");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
