//! HTTP route handlers for the Parley server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - WebSocket endpoint for clients
//! - `POST /events` - Broadcast a persisted record to every connection
//! - `POST /events/{userId}` - Broadcast a record to one user's devices
//! - `GET /stats` - Registry diagnostics
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains
//! the configuration, the [`LifecycleCoordinator`] that owns the registry and
//! dispatcher, and the server start time for uptime reporting.
//!
//! # Example
//!
//! ```rust,no_run
//! use parley_server::routes::{create_router, AppState};
//! use parley_server::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config).expect("invalid config");
//!     state.coordinator.start();
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{validate_bearer, HandshakeParams};
use crate::broadcast::{Audience, BroadcastError};
use crate::config::Config;
use crate::error::{ConfigError, ServerError};
use crate::lifecycle::LifecycleCoordinator;
use crate::types::{RegistryStats, UserId};

// ============================================================================
// Constants
// ============================================================================

/// Maximum body size for event ingestion (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

const BEARER_PREFIX: &str = "Bearer ";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Owner of the registry, dispatcher and socket sessions.
    pub coordinator: Arc<LifecycleCoordinator>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state with a coordinator built from `config`.
    ///
    /// The coordinator is not started.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if authentication is enabled without a JWT secret.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let coordinator = LifecycleCoordinator::from_config(&config)?;
        Ok(Self::with_coordinator(config, Arc::new(coordinator)))
    }

    /// Creates application state around an existing coordinator.
    #[must_use]
    pub fn with_coordinator(config: Config, coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self {
            config: Arc::new(config),
            coordinator,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("coordinator", &self.coordinator)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(post_events))
        .route("/events/{user_id}", post(post_user_events))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/ws", get(get_ws))
        .route("/stats", get(get_stats))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    fn respond(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            error!(error = %self, "Request failed");
        } else if self.is_client_error() {
            debug!(error = %self, "Request rejected");
        }

        let (status, code) = match &self {
            Self::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::Broadcast(BroadcastError::NotStarted) => {
                (StatusCode::SERVICE_UNAVAILABLE, "not_started")
            }
            Self::Broadcast(_) | Self::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
        };
        ErrorResponse::new(self.to_string())
            .with_code(code)
            .respond(status)
    }
}

/// Checks the ingest bearer token unless authentication is disabled.
///
/// Returns the rejection to send when the request is not authorized.
fn authorize_ingest(config: &Config, headers: &HeaderMap) -> Result<(), Response> {
    if config.unsafe_no_auth {
        return Ok(());
    }

    let Some(expected) = config.ingest_token.as_deref() else {
        error!("Ingest token not configured but auth is enabled");
        return Err(ErrorResponse::new("server configuration error")
            .respond(StatusCode::INTERNAL_SERVER_ERROR));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .unwrap_or_default();

    if provided.is_empty() {
        debug!("Missing bearer token on ingest request");
        return Err(ErrorResponse::new("missing bearer token")
            .with_code("missing_token")
            .respond(StatusCode::UNAUTHORIZED));
    }

    if !validate_bearer(provided, expected) {
        warn!("Invalid bearer token on ingest request");
        return Err(ErrorResponse::new("invalid bearer token")
            .with_code("invalid_token")
            .respond(StatusCode::UNAUTHORIZED));
    }

    Ok(())
}

// ============================================================================
// POST /events - Broadcast
// ============================================================================

/// POST /events - Broadcast a record to every connected device.
///
/// # Authentication
///
/// Unless `unsafe_no_auth` is enabled, requests must carry
/// `Authorization: Bearer <PARLEY_INGEST_TOKEN>`.
///
/// # Request Body
///
/// Any JSON value. It is delivered to clients unchanged, as a text frame.
///
/// # Responses
///
/// - `202 Accepted` - Delivery report
/// - `400 Bad Request` - Body is not JSON
/// - `401 Unauthorized` - Missing or invalid bearer token
/// - `503 Service Unavailable` - Hub not started
async fn post_events(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    broadcast_body(&state, &headers, &body, Audience::All)
}

/// POST /events/{userId} - Broadcast a record to every device of one user.
///
/// Same authentication, body and responses as `POST /events`.
async fn post_user_events(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    broadcast_body(&state, &headers, &body, Audience::User(user_id))
}

fn broadcast_body(state: &AppState, headers: &HeaderMap, body: &[u8], audience: Audience) -> Response {
    if let Err(rejection) = authorize_ingest(&state.config, headers) {
        return rejection;
    }

    let event: serde_json::Value = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(err) => {
            debug!(error = %err, "Failed to parse event payload");
            return ErrorResponse::new(format!("invalid event format: {err}"))
                .with_code("invalid_format")
                .respond(StatusCode::BAD_REQUEST);
        }
    };

    match state.coordinator.dispatcher().dispatch(audience, &event) {
        Ok(report) => {
            info!(
                audience = ?audience,
                delivered = report.delivered,
                failed = report.failed,
                "Event accepted and broadcast"
            );
            (StatusCode::ACCEPTED, Json(report)).into_response()
        }
        Err(err) => {
            debug!(audience = ?audience, "Broadcast rejected");
            ServerError::from(err).into_response()
        }
    }
}

// ============================================================================
// GET /ws - WebSocket Connection
// ============================================================================

/// GET /ws - WebSocket endpoint.
///
/// # Query Parameters
///
/// - `token` - Handshake credential (required)
/// - `deviceId` - Device slot (optional, defaults to `default`)
///
/// # WebSocket Protocol
///
/// The upgrade always succeeds. Authentication happens on the open socket;
/// a rejected handshake is closed with code 1008 and one of the reasons
/// "Token required", "Invalid token" or "Authentication failed". Once
/// admitted, the server sends broadcast records as text frames and pings
/// every heartbeat interval.
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(
        device_id = params.device_id.as_deref().unwrap_or_default(),
        "WebSocket client connecting"
    );

    let coordinator = Arc::clone(&state.coordinator);
    ws.on_upgrade(move |socket| async move { coordinator.accept(socket, params).await })
}

// ============================================================================
// GET /stats - Registry diagnostics
// ============================================================================

/// GET /stats - Users and connections currently registered.
///
/// Same bearer authentication as `POST /events`.
async fn get_stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize_ingest(&state.config, &headers) {
        return rejection;
    }

    let stats: RegistryStats = state.coordinator.stats();
    Json(stats).into_response()
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok` while the hub is started, `stopped` otherwise.
    pub status: String,

    /// Number of connected users.
    pub users: usize,

    /// Number of registered connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// No authentication required.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "users": 3,
///   "connections": 5,
///   "uptimeSeconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.coordinator.registry();
    let status = if state.coordinator.is_started() {
        "ok"
    } else {
        "stopped"
    };

    Json(HealthResponse {
        status: status.to_string(),
        users: registry.user_count(),
        connections: registry.connection_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
