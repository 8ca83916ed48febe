//! Parley Server - Main entry point.
//!
//! This binary starts the Parley realtime hub with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT) that closes every socket
//!
//! # Configuration
//!
//! See [`parley_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (no auth, numeric tokens are user ids)
//! PARLEY_UNSAFE_NO_AUTH=true cargo run --bin parley-server
//!
//! # Production mode
//! PARLEY_JWT_SECRET="shared-secret" \
//! PARLEY_INGEST_TOKEN="ingest-token" \
//! PORT=8080 \
//! cargo run --release --bin parley-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use parley_server::config::Config;
use parley_server::lifecycle::LifecycleCoordinator;
use parley_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled):");
            eprintln!("  PARLEY_JWT_SECRET              - HS256 secret for handshake tokens");
            eprintln!("  PARLEY_INGEST_TOKEN            - Bearer token for /events and /stats");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                           - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                       - Log level filter (default: info)");
            eprintln!("  PARLEY_UNSAFE_NO_AUTH          - Disable auth (dev only, set to 'true')");
            eprintln!("  PARLEY_HEARTBEAT_INTERVAL_SECS - Ping interval (default: 30)");
            eprintln!("  PARLEY_SEND_TIMEOUT_MS         - Per-write timeout (default: 5000)");
            eprintln!("  PARLEY_OUTBOUND_CAPACITY       - Frames queued per socket (default: 64)");
            return ExitCode::from(1);
        }
    };

    let auth_mode = if config.unsafe_no_auth {
        "disabled (UNSAFE)"
    } else {
        "enabled"
    };
    info!(
        port = config.port,
        auth_mode = auth_mode,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        "Parley server starting"
    );

    let state = match AppState::new(config.clone()) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Invalid configuration");
            return ExitCode::from(1);
        }
    };
    let coordinator = Arc::clone(&state.coordinator);
    coordinator.start();

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server =
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(Arc::clone(&coordinator)));

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        coordinator.shutdown();
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when a shutdown signal is received, after closing every socket.
///
/// Upgraded WebSockets are not tracked by axum's graceful shutdown, so the
/// hub is stopped here: each client gets a normal close with
/// "Server shutting down" before the listener stops.
async fn shutdown_signal(coordinator: Arc<LifecycleCoordinator>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    let closed = coordinator.shutdown();
    info!(closed, "Hub stopped");
}
