//! The per-socket connection record and its writer task.
//!
//! A [`Connection`] is the small owned record the registry keeps for each
//! admitted socket: identity, liveness flag, transport state, and the sending
//! half of a bounded outbound queue. The socket itself is owned by two tasks:
//! the session's read loop and the writer spawned by [`spawn_writer`], which is
//! the only code that ever writes frames to the socket.
//!
//! Everything on `Connection` is non-blocking. Broadcasts and heartbeats
//! enqueue frames with `try_send`; a full or closed queue is reported as a
//! [`DeliveryError`] so the caller can evict the connection instead of waiting
//! on a slow peer.
//!
//! Two cancellation tokens tie dependent tasks to the connection's lifetime:
//!
//! - the *liveness* token is cancelled as soon as the connection is closed,
//!   terminated, or evicted; heartbeat loops and the read loop watch it
//! - the *kill* token is cancelled only on abrupt termination; the writer
//!   watches it and drops the socket without a close frame

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::types::{ConnectionInfo, ConnectionState, Identity, UserId};

/// Why a frame could not be handed to a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is full; the peer is not keeping up.
    #[error("outbound queue full")]
    QueueFull,

    /// The connection is closing, closed, or its writer has stopped.
    #[error("connection closed")]
    Closed,
}

/// A frame waiting to be written by the connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A serialized event.
    Text(Utf8Bytes),
    /// A liveness ping.
    Ping,
    /// A graceful close; the writer stops after sending it.
    Close { code: u16, reason: &'static str },
    /// The peer started the closing handshake; the writer closes the sink,
    /// which sends the transport's close reply, and stops.
    Finish,
}

/// One live duplex channel to one client process.
pub struct Connection {
    id: Uuid,
    identity: Identity,
    connected_at: DateTime<Utc>,
    alive: AtomicBool,
    state: AtomicU8,
    outbound: mpsc::Sender<OutboundFrame>,
    liveness: CancellationToken,
    kill: CancellationToken,
}

impl Connection {
    /// Creates a connection in the `Connecting` state that writes into `outbound`.
    pub fn new(identity: Identity, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            connected_at: Utc::now(),
            alive: AtomicBool::new(true),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound,
            liveness: CancellationToken::new(),
            kill: CancellationToken::new(),
        }
    }

    /// Creates a connection together with the receiving end of its outbound queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn channel(
        identity: Identity,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self::new(identity, tx)), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Records a pong from the peer.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Clears the alive flag, returning its previous value.
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Moves `Connecting` to `Open`. Returns `false` from any other state.
    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves `Connecting`/`Open` to `Closing`. Returns `true` if this call did it.
    fn begin_closing(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match ConnectionState::from_u8(raw) {
                    ConnectionState::Connecting | ConnectionState::Open => {
                        Some(ConnectionState::Closing as u8)
                    }
                    _ => None,
                }
            })
            .is_ok()
    }

    /// Answers a close frame from the peer.
    ///
    /// Marks the connection closing and asks the writer to complete the
    /// closing handshake. Terminates instead if the queue cannot take it.
    pub(crate) fn acknowledge_close(&self) {
        self.begin_closing();
        if self.enqueue(OutboundFrame::Finish).is_err() {
            self.terminate();
        } else {
            self.liveness.cancel();
        }
    }

    /// Releases a connection that has left the registry.
    ///
    /// A graceful close already in flight is left to finish; any other
    /// connection is terminated.
    pub(crate) fn release(&self) {
        if self.state() == ConnectionState::Closing {
            self.liveness.cancel();
        } else {
            self.terminate();
        }
    }

    /// Marks the transport closed and releases dependent tasks.
    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.liveness.cancel();
    }

    /// Queues a serialized event for delivery.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Closed`] if the connection is not open or its writer
    /// has stopped, [`DeliveryError::QueueFull`] if the peer is too slow.
    pub fn send_text(&self, payload: Utf8Bytes) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed);
        }
        self.enqueue(OutboundFrame::Text(payload))
    }

    /// Queues a liveness ping.
    pub fn ping(&self) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed);
        }
        self.enqueue(OutboundFrame::Ping)
    }

    fn enqueue(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Starts a graceful close without waiting for it to complete.
    ///
    /// Queues a close frame and releases the heartbeat and read loops. If the
    /// queue cannot take the close frame the connection is terminated
    /// instead. Returns `false` if the connection was already closing.
    pub fn close(&self, code: u16, reason: &'static str) -> bool {
        if !self.begin_closing() {
            return false;
        }

        trace!(
            connection_id = %self.id,
            code,
            reason,
            "Closing connection"
        );

        if self.enqueue(OutboundFrame::Close { code, reason }).is_err() {
            self.terminate();
        } else {
            self.liveness.cancel();
        }
        true
    }

    /// Drops the connection abruptly, without a close frame.
    pub fn terminate(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.liveness.cancel();
        self.kill.cancel();
    }

    /// Resolves once the connection has been closed, terminated, or evicted.
    pub fn evicted(&self) -> WaitForCancellationFuture<'_> {
        self.liveness.cancelled()
    }

    /// A handle on the liveness token that does not keep the connection alive.
    pub(crate) fn liveness_token(&self) -> CancellationToken {
        self.liveness.clone()
    }

    pub fn is_evicted(&self) -> bool {
        self.liveness.is_cancelled()
    }

    /// Diagnostic snapshot of this connection.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            user_id: self.identity.user_id,
            device_id: self.identity.device_id.clone(),
            connection_id: self.id,
            is_alive: self.is_alive(),
            state: self.state(),
            connected_at: self.connected_at,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("device_id", &self.identity.device_id)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Spawns the single writer for a connection's socket.
///
/// The writer drains the outbound queue into `sink`. Each write is bounded
/// by `send_timeout`; a failed or timed-out write terminates the connection.
/// The writer stops after a close frame or a peer-initiated close, when the
/// queue is closed, or when the connection is terminated.
pub fn spawn_writer<S>(
    connection: Arc<Connection>,
    sink: S,
    outbound: mpsc::Receiver<OutboundFrame>,
    send_timeout: Duration,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    tokio::spawn(run_writer(connection, sink, outbound, send_timeout))
}

async fn run_writer<S>(
    connection: Arc<Connection>,
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    send_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = connection.kill.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let (message, is_close) = match frame {
            OutboundFrame::Finish => {
                match tokio::time::timeout(send_timeout, sink.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(connection_id = %connection.id, error = %err, "Socket close failed");
                    }
                    Err(_) => {
                        debug!(connection_id = %connection.id, "Socket close timed out");
                    }
                }
                break;
            }
            OutboundFrame::Text(text) => (Message::Text(text), false),
            OutboundFrame::Ping => (Message::Ping(Bytes::new()), false),
            OutboundFrame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: Utf8Bytes::from_static(reason),
                })),
                true,
            ),
        };

        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(
                    connection_id = %connection.id,
                    error = %err,
                    "Socket write failed"
                );
                connection.terminate();
                break;
            }
            Err(_) => {
                warn!(
                    connection_id = %connection.id,
                    user_id = connection.user_id(),
                    timeout_ms = send_timeout.as_millis() as u64,
                    "Socket write timed out, terminating connection"
                );
                connection.terminate();
                break;
            }
        }

        if is_close {
            break;
        }
    }

    connection.mark_closed();
    trace!(connection_id = %connection.id, "Writer stopped");
}
