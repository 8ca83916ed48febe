//! Hub startup, per-socket sessions, and graceful shutdown.
//!
//! The [`LifecycleCoordinator`] owns the registry, the broadcast dispatcher
//! and the handshake authenticator, and runs the pipeline every upgraded
//! socket goes through:
//!
//! ```text
//! authenticate ─fail─▶ close 1008 <reason>
//!      │
//!      ▼
//! spawn writer ─▶ register ─refused─▶ close 1001 "Server shutting down"
//!                     │
//!                     ▼
//!            attach heartbeat ─▶ read loop ─▶ terminate + remove
//! ```
//!
//! The read loop ends when the peer closes, the transport fails, or the
//! connection is evicted (takeover, heartbeat timeout, delivery failure,
//! shutdown). In the graceful cases the session waits, bounded by the send
//! timeout, for the writer to flush the close frame before dropping the
//! socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::{Authenticator, HandshakeParams, InsecureVerifier, JwtVerifier};
use crate::broadcast::BroadcastDispatcher;
use crate::config::Config;
use crate::connection::{spawn_writer, Connection};
use crate::error::ConfigError;
use crate::heartbeat::HeartbeatMonitor;
use crate::registry::{ConnectionRegistry, RegisterOutcome};
use crate::types::{ConnectionState, DisconnectReason, RegistryStats};

/// Close reason sent to every connection when the hub stops.
pub const SHUTDOWN_REASON: &str = "Server shutting down";

/// How a session's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// The peer sent a close frame.
    PeerClosed,
    /// The stream ended without a close frame.
    StreamEnded,
    /// Reading from the socket failed.
    TransportError,
    /// Someone else closed or terminated the connection.
    Evicted,
}

/// Owns the hub's shared components and drives connection lifecycles.
pub struct LifecycleCoordinator {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<BroadcastDispatcher>,
    authenticator: Authenticator,
    heartbeat: HeartbeatMonitor,
    send_timeout: Duration,
    outbound_capacity: usize,
    started: AtomicBool,
}

impl LifecycleCoordinator {
    /// Creates a stopped coordinator from explicit components.
    ///
    /// # Panics
    ///
    /// Panics if `outbound_capacity` is 0.
    pub fn new(
        authenticator: Authenticator,
        heartbeat: HeartbeatMonitor,
        send_timeout: Duration,
        outbound_capacity: usize,
    ) -> Self {
        assert!(outbound_capacity > 0, "outbound capacity must be non-zero");
        let registry = Arc::new(ConnectionRegistry::new());
        // Nothing is admitted until `start`.
        registry.drain();

        Self {
            registry,
            dispatcher: Arc::new(BroadcastDispatcher::new()),
            authenticator,
            heartbeat,
            send_timeout,
            outbound_capacity,
            started: AtomicBool::new(false),
        }
    }

    /// Creates a stopped coordinator from server configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] if authentication is enabled
    /// but no JWT secret is configured.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let authenticator = if config.unsafe_no_auth {
            Authenticator::new(Arc::new(InsecureVerifier))
        } else {
            let secret = config
                .jwt_secret
                .as_deref()
                .ok_or_else(|| ConfigError::missing("PARLEY_JWT_SECRET"))?;
            Authenticator::new(Arc::new(JwtVerifier::new(secret)))
        };

        Ok(Self::new(
            authenticator,
            HeartbeatMonitor::new(config.heartbeat_interval),
            config.send_timeout,
            config.outbound_capacity,
        ))
    }

    /// Opens the hub for connections and broadcasts.
    ///
    /// Starting an already started hub shuts it down first, so every
    /// existing connection is closed and the hub comes back empty.
    pub fn start(&self) {
        if self.is_started() {
            info!("Hub already started, restarting");
            self.shutdown();
        }

        self.registry.reopen();
        self.dispatcher.bind(Arc::clone(&self.registry));
        self.started.store(true, Ordering::Release);
        info!(
            heartbeat_interval_ms = self.heartbeat.interval().as_millis() as u64,
            send_timeout_ms = self.send_timeout.as_millis() as u64,
            outbound_capacity = self.outbound_capacity,
            "Hub started"
        );
    }

    /// Stops the hub and closes every connection with a normal closure.
    ///
    /// Idempotent. Returns how many connections were closed.
    pub fn shutdown(&self) -> usize {
        self.started.store(false, Ordering::Release);
        self.dispatcher.unbind();

        let drained = self.registry.drain();
        for conn in &drained {
            conn.close(close_code::NORMAL, SHUTDOWN_REASON);
            trace!(
                user_id = conn.user_id(),
                device_id = %conn.device_id(),
                connection_id = %conn.id(),
                reason = %DisconnectReason::ServerShutdown,
                "Connection closed for shutdown"
            );
        }

        if !drained.is_empty() {
            info!(count = drained.len(), "Hub stopped, connections closed");
        }
        drained.len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<BroadcastDispatcher> {
        &self.dispatcher
    }

    /// Runs the full session for an upgraded WebSocket.
    ///
    /// Returns once the socket is closed and the connection has left the
    /// registry.
    pub async fn accept(&self, socket: WebSocket, params: HandshakeParams) {
        let (sink, stream) = socket.split();
        self.run_session(sink, stream, params).await;
    }

    /// Runs the session pipeline over the two halves of a socket.
    pub async fn run_session<Tx, Rx, E>(&self, mut sink: Tx, stream: Rx, params: HandshakeParams)
    where
        Tx: Sink<Message> + Unpin + Send + 'static,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        if !self.is_started() {
            debug!("Hub not started, rejecting socket");
            self.close_unregistered(&mut sink, close_code::AWAY, SHUTDOWN_REASON)
                .await;
            return;
        }

        let identity = match self.authenticator.authenticate(&params) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(
                    device_id = params.device_id.as_deref().unwrap_or_default(),
                    malformed = err.is_format_error(),
                    error = %err,
                    "Handshake rejected"
                );
                self.close_unregistered(&mut sink, close_code::POLICY, err.close_reason())
                    .await;
                return;
            }
        };

        let (conn, outbound) = Connection::channel(identity, self.outbound_capacity);
        let writer = spawn_writer(Arc::clone(&conn), sink, outbound, self.send_timeout);

        if let RegisterOutcome::Refused = self.registry.register(Arc::clone(&conn)) {
            conn.close(close_code::AWAY, SHUTDOWN_REASON);
            self.flush_writer(writer).await;
            return;
        }

        info!(
            user_id = conn.user_id(),
            device_id = %conn.device_id(),
            connection_id = %conn.id(),
            "Connection established"
        );

        self.heartbeat.attach(Arc::clone(&self.registry), &conn);

        let outcome = read_loop(&conn, stream).await;
        let graceful = match outcome {
            ReadOutcome::PeerClosed => true,
            ReadOutcome::Evicted => conn.state() == ConnectionState::Closing,
            ReadOutcome::StreamEnded | ReadOutcome::TransportError => false,
        };
        if graceful {
            self.flush_writer(writer).await;
        }

        conn.terminate();
        self.registry.remove(&conn);

        let reason = match outcome {
            ReadOutcome::PeerClosed | ReadOutcome::StreamEnded => DisconnectReason::ClientClosed,
            ReadOutcome::TransportError => DisconnectReason::TransportError,
            ReadOutcome::Evicted => DisconnectReason::Stale,
        };
        debug!(
            user_id = conn.user_id(),
            device_id = %conn.device_id(),
            connection_id = %conn.id(),
            reason = %reason,
            "Session ended"
        );
    }

    /// Sends a close frame on a socket that never got a writer.
    async fn close_unregistered<Tx>(&self, sink: &mut Tx, code: u16, reason: &'static str)
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: fmt::Display,
    {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        }));
        match tokio::time::timeout(self.send_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "Failed to send close frame"),
            Err(_) => debug!("Timed out sending close frame"),
        }
    }

    /// Waits for the writer to send its queued close frame.
    async fn flush_writer(&self, writer: JoinHandle<()>) {
        if tokio::time::timeout(self.send_timeout, writer).await.is_err() {
            debug!("Writer did not finish within the send timeout");
        }
    }
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("started", &self.is_started())
            .field("connections", &self.registry.connection_count())
            .field("heartbeat", &self.heartbeat)
            .field("send_timeout", &self.send_timeout)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish()
    }
}

async fn read_loop<Rx, E>(conn: &Connection, mut stream: Rx) -> ReadOutcome
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = conn.evicted() => return ReadOutcome::Evicted,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Pong(_))) => conn.mark_alive(),
            Some(Ok(Message::Close(frame))) => {
                trace!(
                    connection_id = %conn.id(),
                    code = frame.as_ref().map(|f| f.code),
                    "Peer sent close frame"
                );
                conn.acknowledge_close();
                return ReadOutcome::PeerClosed;
            }
            Some(Ok(_)) => {
                trace!(connection_id = %conn.id(), "Ignoring inbound frame");
            }
            Some(Err(err)) => {
                debug!(connection_id = %conn.id(), error = %err, "Socket read failed");
                return ReadOutcome::TransportError;
            }
            None => return ReadOutcome::StreamEnded,
        }
    }
}
