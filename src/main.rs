use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use control_tower::config::{LogFormat, PersistenceBackend};
use control_tower::persistence::with_timeout;
use control_tower::state::build_gateway;
use control_tower::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // .env must be loaded before the subscriber reads RUST_LOG / LOG_FORMAT
    let _ = dotenvy::dotenv();
    init_tracing();

    info!(
        "Starting Control Tower access control v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(LogFormat::Pretty);

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        backend = ?config.persistence_backend,
        rate_limit = config.rate_limit_max_requests,
        admin_api = config.admin_enabled(),
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    }

    // Connect to the store
    let gateway = build_gateway(&config).map_err(|e| {
        error!("Failed to set up persistence: {e}");
        exitcode::CONFIG
    })?;

    if config.persistence_startup_check && config.persistence_backend == PersistenceBackend::Rest {
        info!("Checking persistence reachability...");
        with_timeout(config.persistence_timeout, gateway.ping())
            .await
            .map_err(|e| {
                error!("Persistence unreachable at startup: {e}");
                exitcode::UNAVAILABLE
            })?;
        info!("Persistence reachable");
    } else if !config.persistence_startup_check {
        warn!("Persistence startup check disabled; blocks are not enforced while the store is down");
    }

    // Build application state and router
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let state = AppState::new(config, gateway).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("Endpoints:");
    info!("  GET    /health                 - Health check");
    info!("  GET    /ready                  - Readiness check");
    info!("  GET    /dashboard              - Security overview");
    info!("  GET    /api/status             - API status");
    if state.config.admin_enabled() {
        info!("  GET    /admin/blocked          - List blocked addresses");
        info!("  POST   /admin/blocked          - Block an address");
        info!("  DELETE /admin/blocked/{{addr}}   - Unblock an address");
        info!("  GET    /admin/events           - Query the audit log");
        info!("  POST   /admin/failed-logins    - Report a failed login");
    }

    // Start server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Flush pending audit writes and stop background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
